use framelink::event::RawEvent;
use framelink::ring::EventRing;
use framelink::shm::ShmRegion;
use framelink::FrameLinkError;
use proptest::prelude::*;

fn raw(id: u32) -> RawEvent {
    RawEvent {
        category: 2,
        kind: 10,
        id,
        ..RawEvent::default()
    }
}

#[derive(Debug, Clone)]
enum Op {
    Push,
    Pop,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Push), Just(Op::Pop)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any interleaving of pushes and pops behaves like a bounded FIFO
    #[test]
    fn ring_matches_bounded_fifo(capacity_log in 1u32..6, ops in proptest::collection::vec(op(), 1..200)) {
        let capacity = 1usize << capacity_log;
        let region = ShmRegion::anonymous("ring_props", EventRing::size_for(capacity)).unwrap();
        let ring = EventRing::init(&region, 0, capacity).unwrap();

        let mut model = std::collections::VecDeque::new();
        let mut next_id = 0u32;

        for op in ops {
            match op {
                Op::Push => {
                    let before = ring.cursors();
                    match ring.try_push(&raw(next_id)) {
                        Ok(pushed) => {
                            prop_assert!(model.len() < capacity);
                            prop_assert_eq!(pushed.was_empty, model.is_empty());
                            model.push_back(next_id);
                            prop_assert_eq!(pushed.free, capacity - model.len());
                        }
                        Err(FrameLinkError::Saturated { .. }) => {
                            prop_assert_eq!(model.len(), capacity);
                            prop_assert_eq!(ring.cursors(), before);
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                    next_id += 1;
                }
                Op::Pop => {
                    let popped = ring.try_pop().map(|ev| ev.id);
                    prop_assert_eq!(popped, model.pop_front());
                }
            }
            prop_assert_eq!(ring.len(), model.len());
        }
    }

    /// Compacting a ring keeps its contents and order
    #[test]
    fn drain_and_refill_preserves_order(count in 0usize..16) {
        let region = ShmRegion::anonymous("ring_refill", EventRing::size_for(16)).unwrap();
        let ring = EventRing::init(&region, 0, 16).unwrap();
        for id in 0..count as u32 {
            ring.try_push(&raw(id)).unwrap();
        }

        let drained = ring.drain();
        ring.reset();
        for ev in &drained {
            ring.try_push(ev).unwrap();
        }

        prop_assert_eq!(ring.cursors(), (0, count as u64));
        let ids: Vec<u32> = std::iter::from_fn(|| ring.try_pop()).map(|ev| ev.id).collect();
        prop_assert_eq!(ids, (0..count as u32).collect::<Vec<_>>());
    }
}
