use super::{Mode, Serialize, Serializer};
use crate::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::Hash;

macro_rules! primitive {
    ($($ty:ty),* $(,)?) => {$(
        impl Serialize for $ty {
            fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
                let mut bytes = self.to_le_bytes();
                ser.primitive(&mut bytes)?;
                *self = <$ty>::from_le_bytes(bytes);
                Ok(())
            }
        }
    )*};
}

primitive!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);

impl Serialize for usize {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        ser.length(self)
    }
}

impl Serialize for isize {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut wide = *self as i64;
        wide.serialize_order(ser)?;
        *self = isize::try_from(wide).map_err(|_| Error::InvalidEncoding(format!("{wide} overflows isize")))?;
        Ok(())
    }
}

// Written as a 4-byte integer; anything but 0 or 1 is rejected on unpack.
impl Serialize for bool {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut value = i32::from(*self);
        value.serialize_order(ser)?;
        *self = match value {
            0 => false,
            1 => true,
            other => return Err(Error::InvalidEncoding(format!("{other} is not a bool"))),
        };
        Ok(())
    }
}

impl Serialize for () {
    fn serialize_order(&mut self, _: &mut Serializer<'_>) -> crate::Result {
        Ok(())
    }
}

impl Serialize for String {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            let raw = ser.take(len)?;
            *self = std::str::from_utf8(raw)
                .map_err(|e| Error::InvalidEncoding(e.to_string()))?
                .to_owned();
        } else {
            ser.put(self.as_bytes());
        }
        Ok(())
    }
}

impl<T> Serialize for Option<T>
where
    T: Serialize + Default,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut present = u8::from(self.is_some());
        present.serialize_order(ser)?;
        match (ser.mode(), present) {
            (Mode::Unpack, 0) => *self = None,
            (Mode::Unpack, 1) => {
                let mut value = T::default();
                value.serialize_order(ser)?;
                *self = Some(value);
            },
            (Mode::Unpack, other) => {
                return Err(Error::InvalidEncoding(format!("{other} is not an option flag")));
            },
            _ => {
                if let Some(value) = self {
                    value.serialize_order(ser)?;
                }
            },
        }
        Ok(())
    }
}

impl<T, const N: usize> Serialize for [T; N]
where
    T: Serialize,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        for item in self.iter_mut() {
            item.serialize_order(ser)?;
        }
        Ok(())
    }
}

impl<A, B> Serialize for (A, B)
where
    A: Serialize,
    B: Serialize,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        self.0.serialize_order(ser)?;
        self.1.serialize_order(ser)
    }
}

impl<A, B, C> Serialize for (A, B, C)
where
    A: Serialize,
    B: Serialize,
    C: Serialize,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        self.0.serialize_order(ser)?;
        self.1.serialize_order(ser)?;
        self.2.serialize_order(ser)
    }
}

/// Longest container of zero-sized elements that unpacking accepts. Such elements occupy no input, so nothing else
/// bounds a corrupt count.
const MAX_ZERO_SIZED_ELEMENTS: usize = 1 << 20;

/// Unpack `len` default-constructed elements, handing each to `push`.
fn unpack_elements<T, F>(len: usize, ser: &mut Serializer<'_>, mut push: F) -> crate::Result
where
    T: Serialize + Default,
    F: FnMut(T),
{
    if std::mem::size_of::<T>() == 0 && len > MAX_ZERO_SIZED_ELEMENTS {
        return Err(Error::InvalidEncoding(format!(
            "{len} zero-sized elements exceed the limit of {MAX_ZERO_SIZED_ELEMENTS}"
        )));
    }
    for _ in 0..len {
        let mut item = T::default();
        item.serialize_order(ser)?;
        push(item);
    }
    Ok(())
}

impl<T> Serialize for Vec<T>
where
    T: Serialize + Default,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            // a corrupt count must not turn into a huge allocation before the input runs out
            self.reserve(len.min(ser.remaining()));
            unpack_elements(len, ser, |item| self.push(item))
        } else {
            self.iter_mut().try_for_each(|item| item.serialize_order(ser))
        }
    }
}

impl<T> Serialize for VecDeque<T>
where
    T: Serialize + Default,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            unpack_elements(len, ser, |item| self.push_back(item))
        } else {
            self.iter_mut().try_for_each(|item| item.serialize_order(ser))
        }
    }
}

// Set members and map keys are immutable in place, so packing runs each one through a clone.

impl<T> Serialize for BTreeSet<T>
where
    T: Serialize + Default + Ord + Clone,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            unpack_elements(len, ser, |item| {
                self.insert(item);
            })
        } else {
            self.iter().try_for_each(|item| item.clone().serialize_order(ser))
        }
    }
}

impl<K, V> Serialize for BTreeMap<K, V>
where
    K: Serialize + Default + Ord + Clone,
    V: Serialize + Default,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            unpack_elements(len, ser, |(key, value)| {
                self.insert(key, value);
            })
        } else {
            for (key, value) in self.iter_mut() {
                key.clone().serialize_order(ser)?;
                value.serialize_order(ser)?;
            }
            Ok(())
        }
    }
}

// Hashed containers pack in key order so that equal contents always produce equal bytes on every rank.

impl<T> Serialize for HashSet<T>
where
    T: Serialize + Default + Eq + Hash + Ord + Clone,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            self.reserve(len.min(ser.remaining()));
            unpack_elements(len, ser, |item| {
                self.insert(item);
            })
        } else {
            let mut members: Vec<&T> = self.iter().collect();
            members.sort();
            members.into_iter().try_for_each(|item| item.clone().serialize_order(ser))
        }
    }
}

impl<K, V> Serialize for HashMap<K, V>
where
    K: Serialize + Default + Eq + Hash + Ord + Clone,
    V: Serialize + Default,
{
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = self.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            self.clear();
            self.reserve(len.min(ser.remaining()));
            unpack_elements(len, ser, |(key, value)| {
                self.insert(key, value);
            })
        } else {
            let mut entries: Vec<(&K, &mut V)> = self.iter_mut().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (key, value) in entries {
                key.clone().serialize_order(ser)?;
                value.serialize_order(ser)?;
            }
            Ok(())
        }
    }
}
