use super::{Mode, Serialize, Serializer};
use crate::Error;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

/// Runtime tag identifying a registered concrete type inside a serialized stream.
pub type TypeTag = u32;

/// The capability that lets a value be serialized through a boxed trait object.
///
/// Base traits for polymorphic objects, such as [`Activity`], extend this trait so that a [`TypeRegistry`] can look up
/// the concrete type behind a `Box<dyn Base>`. The provided [`type_name()`] is what the registry keys on; it is
/// resolved through the trait object's vtable and so always names the concrete type. There is normally no reason to
/// override it.
///
/// [`Activity`]: crate::activity::Activity
/// [`type_name()`]: Serializable::type_name
pub trait Serializable: Serialize + Debug + Send {
    /// Name of the concrete type, as reported by [`std::any::type_name()`].
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

struct Factory<Base: ?Sized> {
    type_name: &'static str,
    construct: fn() -> Box<Base>,
}

/// Maps concrete types reachable through `Box<Base>` to stable numeric tags and back.
///
/// Tags are handed out sequentially in registration order, so every rank that takes part in an exchange must register
/// the same types in the same order before any data moves. Once built, a registry is only read; share it with an
/// [`Arc`] between the engine and whatever else serializes polymorphic values.
///
/// Packing a boxed object writes its tag and then runs the concrete type's [`Serialize`] implementation. Unpacking
/// reads the tag, allocates a fresh instance through the registered factory, and lets the instance fill itself in. The
/// tag is the only self-describing element of the stream.
///
/// ```
/// use parsync::serialization::{Serializable, Serialize, Serializer, TypeRegistry};
///
/// trait Shape: Serializable {
///     fn area(&self) -> u64;
/// }
///
/// #[derive(Debug, Default)]
/// struct Square(u64);
///
/// impl Serialize for Square {
///     fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
///         self.0.serialize_order(ser)
///     }
/// }
/// impl Serializable for Square {}
/// impl Shape for Square {
///     fn area(&self) -> u64 {
///         self.0 * self.0
///     }
/// }
///
/// let mut registry: TypeRegistry<dyn Shape> = TypeRegistry::new();
/// registry.register::<Square>(|| Box::new(Square::default())).unwrap();
///
/// let mut shapes: Vec<Box<dyn Shape>> = vec![Box::new(Square(3))];
/// let bytes = registry.pack_all(&mut shapes).unwrap();
/// let decoded = registry.unpack_all(&bytes).unwrap();
/// assert_eq!(9, decoded[0].area());
/// ```
///
/// [`Arc`]: std::sync::Arc
pub struct TypeRegistry<Base>
where
    Base: Serializable + ?Sized,
{
    tags: HashMap<&'static str, TypeTag>,
    factories: Vec<Factory<Base>>,
}

impl<Base> TypeRegistry<Base>
where
    Base: Serializable + ?Sized,
{
    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            factories: Vec::new(),
        }
    }

    /// Register `Concrete` with a factory that builds a blank instance for unpacking into. Returns the type's tag.
    /// Registering the same type twice returns the existing tag and keeps the original factory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FactoryMismatch`] if `construct` builds something other than a `Concrete`; the registry is
    /// left unchanged.
    pub fn register<Concrete>(&mut self, construct: fn() -> Box<Base>) -> crate::Result<TypeTag>
    where
        Concrete: Serializable,
    {
        let type_name = std::any::type_name::<Concrete>();
        if let Some(tag) = self.tags.get(type_name) {
            return Ok(*tag);
        }

        let constructed = Serializable::type_name(&*construct());
        if constructed != type_name {
            return Err(Error::FactoryMismatch {
                registered: type_name,
                constructed,
            });
        }

        let tag = self.factories.len() as TypeTag;
        self.factories.push(Factory { type_name, construct });
        self.tags.insert(type_name, tag);
        Ok(tag)
    }

    /// Tag assigned to the concrete type called `type_name`, if it was registered.
    pub fn tag_of(&self, type_name: &str) -> Option<TypeTag> {
        self.tags.get(type_name).copied()
    }

    /// Name of the concrete type registered under `tag`.
    pub fn type_name_of(&self, tag: TypeTag) -> Option<&'static str> {
        self.factories.get(tag as usize).map(|factory| factory.type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Run a polymorphic slot through `ser`. SIZE and PACK read the boxed object in the slot; UNPACK replaces the
    /// slot's contents with a newly allocated object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnregisteredType`] when packing an object whose type was never registered,
    /// [`Error::UnknownTypeTag`] when unpacking a tag with no factory, [`Error::InvalidEncoding`] when asked to pack an
    /// empty slot, and any error from the concrete type's own serialization.
    pub fn apply(&self, slot: &mut Option<Box<Base>>, ser: &mut Serializer<'_>) -> crate::Result {
        match ser.mode() {
            Mode::Size | Mode::Pack => match slot {
                Some(object) => self.pack_object(object, ser),
                None => Err(Error::InvalidEncoding("cannot pack an empty polymorphic slot".into())),
            },
            Mode::Unpack => {
                *slot = Some(self.unpack_object(ser)?);
                Ok(())
            },
        }
    }

    /// Size or pack one boxed object: its tag, then its fields.
    ///
    /// # Errors
    ///
    /// See [`apply()`].
    ///
    /// [`apply()`]: TypeRegistry::apply
    pub fn pack_object(&self, object: &mut Box<Base>, ser: &mut Serializer<'_>) -> crate::Result {
        let type_name = Serializable::type_name(&**object);
        let mut tag = self
            .tag_of(type_name)
            .ok_or(Error::UnregisteredType { type_name })?;
        tag.serialize_order(ser)?;
        Serialize::serialize_order(&mut **object, ser)
    }

    /// Read a tag, allocate the matching concrete type, and unpack it.
    ///
    /// # Errors
    ///
    /// See [`apply()`].
    ///
    /// [`apply()`]: TypeRegistry::apply
    pub fn unpack_object(&self, ser: &mut Serializer<'_>) -> crate::Result<Box<Base>> {
        let mut tag: TypeTag = 0;
        tag.serialize_order(ser)?;
        let factory = self
            .factories
            .get(tag as usize)
            .ok_or(Error::UnknownTypeTag { tag })?;
        let mut object = (factory.construct)();
        Serialize::serialize_order(&mut *object, ser)?;
        Ok(object)
    }

    /// Run a sequence of boxed objects through `ser` as a count followed by each tagged object.
    ///
    /// # Errors
    ///
    /// See [`apply()`].
    ///
    /// [`apply()`]: TypeRegistry::apply
    pub fn apply_seq(&self, objects: &mut Vec<Box<Base>>, ser: &mut Serializer<'_>) -> crate::Result {
        let mut len = objects.len();
        ser.length(&mut len)?;
        if ser.mode() == Mode::Unpack {
            objects.clear();
            objects.reserve(len.min(ser.remaining()));
            for _ in 0..len {
                objects.push(self.unpack_object(ser)?);
            }
            Ok(())
        } else {
            objects.iter_mut().try_for_each(|object| self.pack_object(object, ser))
        }
    }

    /// Pack a sequence of boxed objects into a new buffer.
    ///
    /// # Errors
    ///
    /// See [`apply()`] and [`pack_with()`].
    ///
    /// [`apply()`]: TypeRegistry::apply
    /// [`pack_with()`]: super::pack_with
    pub fn pack_all(&self, objects: &mut Vec<Box<Base>>) -> crate::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        super::pack_with(&mut buffer, |ser| self.apply_seq(objects, ser))?;
        Ok(buffer)
    }

    /// Unpack a sequence produced by [`pack_all()`].
    ///
    /// # Errors
    ///
    /// See [`apply()`] and [`unpack_with()`].
    ///
    /// [`pack_all()`]: TypeRegistry::pack_all
    /// [`apply()`]: TypeRegistry::apply
    /// [`unpack_with()`]: super::unpack_with
    pub fn unpack_all(&self, data: &[u8]) -> crate::Result<Vec<Box<Base>>> {
        let mut objects = Vec::new();
        super::unpack_with(data, |ser| self.apply_seq(&mut objects, ser))?;
        Ok(objects)
    }
}

impl<Base> Default for TypeRegistry<Base>
where
    Base: Serializable + ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Base> Debug for TypeRegistry<Base>
where
    Base: Serializable + ?Sized,
{
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|factory| factory.type_name))
            .finish()
    }
}
