#![no_main]

use libfuzzer_sys::fuzz_target;
use lyn::conn::{ConnTable, Flags};
use lyn::death_queue::DeathQueue;

const SLOTS: usize = 64;

/// Walk the queue from the head, checking that every node's neighbour links
/// point back at it and that exactly the tracked set is linked.
fn check_links(dq: &DeathQueue, conns: &ConnTable, linked: &[bool; SLOTS]) {
    let mut prev = -1;
    let mut at = dq.head().unwrap_or(-1);
    let mut count = 0;
    while at != -1 {
        let conn = unsafe { conns.slot(at as usize) };
        assert_eq!(prev, conn.prev, "prev link of {at}");
        assert!(linked[at as usize], "{at} linked but not tracked");
        count += 1;
        assert!(count <= SLOTS, "cycle detected");
        prev = at;
        at = conn.next;
    }
    assert_eq!(linked.iter().filter(|&&l| l).count(), count);
}

fuzz_target!(|data: &[u8]| {
    let conns = ConnTable::new(SLOTS);
    let mut dq = DeathQueue::new(3);
    let mut linked = [false; SLOTS];

    for chunk in data.chunks(2) {
        let op = chunk[0] % 4;
        let idx = (chunk.get(1).copied().unwrap_or(0) as usize % SLOTS) as i32;

        match op {
            0 => {
                if !linked[idx as usize] {
                    let conn = unsafe { conns.slot(idx as usize) };
                    conn.flags = Flags::ALIVE | Flags::KEEP_ALIVE;
                    conn.time_to_die = dq.deadline();
                    dq.insert(&conns, idx);
                    linked[idx as usize] = true;
                }
            }
            1 => {
                if linked[idx as usize] {
                    dq.remove(&conns, idx);
                    linked[idx as usize] = false;
                }
            }
            2 => {
                if linked[idx as usize] {
                    dq.move_to_tail(&conns, idx);
                }
            }
            _ => {
                dq.tick();
                while let Some(head) = dq.expired_head(&conns) {
                    dq.remove(&conns, head);
                    linked[head as usize] = false;
                }
                dq.reset_if_empty();
            }
        }

        check_links(&dq, &conns, &linked);
    }
});
