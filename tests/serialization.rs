mod util;

use parsync::activity::{Activity, ActivityRegistry};
use parsync::serialization::{pack, size_of, unpack, Serializable, Serialize, Serializer};
use parsync::Error;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use util::{Credit, Packet};

/// A struct touching every family of encodings.
#[derive(Debug, Default, Clone, PartialEq)]
struct Snapshot {
    id: u64,
    offset: i32,
    ratio: f64,
    enabled: bool,
    label: String,
    samples: Vec<u16>,
    pending: VecDeque<(u8, i64)>,
    counters: HashMap<String, u32>,
    seen: HashSet<u64>,
    ordered: BTreeMap<u32, Vec<u8>>,
    fallback: Option<String>,
    corners: [i16; 4],
    width: usize,
}

impl Serialize for Snapshot {
    fn serialize_order(&mut self, ser: &mut Serializer<'_>) -> parsync::Result {
        self.id.serialize_order(ser)?;
        self.offset.serialize_order(ser)?;
        self.ratio.serialize_order(ser)?;
        self.enabled.serialize_order(ser)?;
        self.label.serialize_order(ser)?;
        self.samples.serialize_order(ser)?;
        self.pending.serialize_order(ser)?;
        self.counters.serialize_order(ser)?;
        self.seen.serialize_order(ser)?;
        self.ordered.serialize_order(ser)?;
        self.fallback.serialize_order(ser)?;
        self.corners.serialize_order(ser)?;
        self.width.serialize_order(ser)
    }
}

fn random_string(rng: &mut Pcg64) -> String {
    let len = rng.random_range(0..12);
    (0..len).map(|_| rng.random_range('a'..='z')).collect()
}

fn random_snapshot(rng: &mut Pcg64) -> Snapshot {
    Snapshot {
        id: rng.random(),
        offset: rng.random(),
        ratio: rng.random_range(-1e6..1e6),
        enabled: rng.random(),
        label: random_string(rng),
        samples: (0..rng.random_range(0..20)).map(|_| rng.random()).collect(),
        pending: (0..rng.random_range(0..5)).map(|_| (rng.random(), rng.random())).collect(),
        counters: (0..rng.random_range(0..6))
            .map(|_| (random_string(rng), rng.random()))
            .collect(),
        seen: (0..rng.random_range(0..6)).map(|_| rng.random()).collect(),
        ordered: (0..rng.random_range(0..4))
            .map(|_| (rng.random(), (0..rng.random_range(0..8)).map(|_| rng.random()).collect()))
            .collect(),
        fallback: if rng.random() { Some(random_string(rng)) } else { None },
        corners: rng.random(),
        width: rng.random_range(0..usize::MAX / 2),
    }
}

#[test]
fn random_values_round_trip_with_exact_sizes() {
    let mut rng = Pcg64::seed_from_u64(1_729);
    for _ in 0..200 {
        let mut original = random_snapshot(&mut rng);
        let expected_size = size_of(&mut original).unwrap();
        let bytes = pack(&mut original).unwrap();
        assert_eq!(expected_size, bytes.len(), "size pass disagreed with pack");

        let decoded: Snapshot = unpack(&bytes).unwrap();
        assert_eq!(original, decoded, "value changed across a round trip");
    }
}

#[test]
fn equal_hash_maps_pack_identically() {
    let mut forward: HashMap<u32, u32> = (0..64).map(|key| (key, key * 3)).collect();
    let mut backward: HashMap<u32, u32> = (0..64).rev().map(|key| (key, key * 3)).collect();
    assert_eq!(pack(&mut forward).unwrap(), pack(&mut backward).unwrap());
}

#[test]
fn every_truncation_is_reported() {
    let mut rng = Pcg64::seed_from_u64(99);
    let mut original = random_snapshot(&mut rng);
    let bytes = pack(&mut original).unwrap();

    for cut in 0..bytes.len() {
        match unpack::<Snapshot>(&bytes[..cut]) {
            Err(Error::Truncated { .. }) | Err(Error::InvalidEncoding(_)) => {},
            other => panic!("cut at {cut} of {} gave {other:?}", bytes.len()),
        }
    }
}

#[test]
fn mixed_activity_streams_keep_their_concrete_types() {
    let registry = util::registry();
    let mut rng = Pcg64::seed_from_u64(7);

    let mut activities: Vec<Box<dyn Activity>> = (0..100)
        .map(|sequence| -> Box<dyn Activity> {
            if rng.random_bool(0.5) {
                Packet::boxed(sequence, rng.random_range(0..1_000), sequence as u32)
            } else {
                Box::new(Credit {
                    link_id: sequence,
                    delivery_time: rng.random_range(0..1_000),
                    amount: rng.random(),
                    note: Some(format!("credit {sequence}")),
                })
            }
        })
        .collect();

    let bytes = registry.pack_all(&mut activities).unwrap();
    let decoded = registry.unpack_all(&bytes).unwrap();

    assert_eq!(activities.len(), decoded.len());
    for (sent, received) in activities.iter().zip(&decoded) {
        assert_eq!(sent.type_name(), received.type_name(), "concrete type was not preserved");
        assert_eq!(sent.link_id(), received.link_id());
        assert_eq!(sent.delivery_time(), received.delivery_time());
        assert_eq!(format!("{sent:?}"), format!("{received:?}"));
    }
}

#[test]
fn registration_order_decides_tags() {
    let registry = util::registry();
    assert_eq!(Some(0), registry.tag_of(std::any::type_name::<Packet>()));
    assert_eq!(Some(1), registry.tag_of(std::any::type_name::<Credit>()));
}

#[test]
fn unregistered_and_unknown_types_are_rejected() {
    let mut only_packets = ActivityRegistry::new();
    only_packets.register::<Packet>(|| Box::new(Packet::default())).unwrap();

    let mut credits: Vec<Box<dyn Activity>> = vec![Box::new(Credit::default())];
    assert_eq!(
        Err(Error::UnregisteredType {
            type_name: std::any::type_name::<Credit>()
        }),
        only_packets.pack_all(&mut credits).map(|_| ())
    );

    let bytes = util::registry().pack_all(&mut credits).unwrap();
    assert!(matches!(
        only_packets.unpack_all(&bytes),
        Err(Error::UnknownTypeTag { tag: 1 })
    ));
}
