mod util;

use parsync::transport::{
    all_gather, broadcast, recv, recv_buffer, send, send_buffer, MemoryTransport, MemoryTransportConfig, Transport,
    LENGTH_PREFIX,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use std::collections::BTreeMap;
use util::run_ranks;

const FRAGMENT: usize = 64;

#[test]
fn payload_spanning_several_fragments_is_rebuilt_exactly() {
    util::init_tracing();
    let mut rng = Pcg64::seed_from_u64(2024);
    let payload: Vec<u8> = (0..2 * FRAGMENT + 37).map(|_| rng.random()).collect();

    let config = MemoryTransportConfig::default().with_max_fragment(FRAGMENT);
    let received = run_ranks(config, |transport| {
        if transport.rank() == 0 {
            send_buffer(&transport, 1, 5, &payload).unwrap();
            None
        } else {
            Some(recv_buffer(&transport, 0, 5).unwrap())
        }
    });

    assert_eq!(Some(&payload), received[1].as_ref(), "payload changed in transit");
}

#[test]
fn wire_format_is_length_then_fragments() {
    let config = MemoryTransportConfig::default().with_max_fragment(FRAGMENT);
    let [sender, receiver]: [MemoryTransport; 2] = MemoryTransport::fabric(config).try_into().unwrap();
    let payload = vec![7u8; FRAGMENT * 2];
    send_buffer(&sender, 1, 0, &payload).unwrap();

    let mut prefix = [0; LENGTH_PREFIX];
    receiver.recv_bytes(0, 0, &mut prefix).unwrap();
    assert_eq!(payload.len() as u64, u64::from_le_bytes(prefix));

    let mut fragment = vec![0; FRAGMENT];
    receiver.recv_bytes(0, 0, &mut fragment).unwrap();
    receiver.recv_bytes(0, 0, &mut fragment).unwrap();
    receiver
        .recv_bytes(0, 0, &mut [])
        .expect("an exact multiple should still end with an empty fragment");
}

#[test]
fn values_sent_to_one_peer_arrive_in_send_order() {
    let results = run_ranks(MemoryTransportConfig::default(), |transport| {
        if transport.rank() == 0 {
            for value in 0..50u32 {
                send(&transport, 1, 1, &mut format!("message {value}")).unwrap();
            }
            Vec::new()
        } else {
            (0..50).map(|_| recv::<_, String>(&transport, 0, 1).unwrap()).collect()
        }
    });

    let expected: Vec<_> = (0..50).map(|value| format!("message {value}")).collect();
    assert_eq!(expected, results[1]);
}

#[test]
fn broadcast_reaches_every_rank() {
    let config = MemoryTransportConfig::default().with_participants(4);
    let results = run_ranks(config, |transport| {
        let mut table = BTreeMap::new();
        if transport.rank() == 1 {
            table.insert(String::from("clock"), 2_000_000u64);
            table.insert(String::from("lookahead"), 50);
        }
        broadcast(&transport, &mut table, 1).unwrap();
        table
    });

    for table in &results {
        assert_eq!(&results[1], table);
        assert_eq!(Some(&50), table.get("lookahead"));
    }
}

#[test]
fn all_gather_orders_contributions_by_rank() {
    let config = MemoryTransportConfig::default()
        .with_participants(5)
        .with_max_fragment(FRAGMENT);
    let results = run_ranks(config, |transport| {
        let mut contribution = vec![transport.rank() as u64; 10 * transport.rank() as usize];
        all_gather(&transport, &mut contribution).unwrap()
    });

    for gathered in results {
        assert_eq!(5, gathered.len());
        for (rank, contribution) in gathered.iter().enumerate() {
            assert_eq!(10 * rank, contribution.len());
            assert!(contribution.iter().all(|&value| value == rank as u64));
        }
    }
}

#[test]
fn repeated_collectives_stay_in_step() {
    let config = MemoryTransportConfig::default().with_participants(3);
    let results = run_ranks(config, |transport| {
        let mut sums = Vec::new();
        for round in 0..10u64 {
            let mut value = round * 10 + transport.rank() as u64;
            let gathered = all_gather(&transport, &mut value).unwrap();
            let mut total: u64 = gathered.iter().sum();
            broadcast(&transport, &mut total, (round % 3) as u32).unwrap();
            sums.push(total);
        }
        sums
    });

    let expected: Vec<u64> = (0..10).map(|round| 30 * round + 3).collect();
    for sums in results {
        assert_eq!(expected, sums);
    }
}
