//! Fuzz testing for the arena allocator.
//!
//! Replays arbitrary allocate / free / overwrite / fetch / defragment
//! sequences against a model map on a small bounded store and checks that
//! every live object reads back intact and every window chain stays valid.

#![no_main]

use std::collections::HashMap;
use std::sync::Arc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parking_lot::Mutex;

use viewarena::{ArenaStore, ObjectHandle, Overwritten, Relocation};

#[derive(Debug, Arbitrary)]
enum Op {
    Allocate { len: u16, fill: u8 },
    AllocateRelocating { len: u16, fill: u8 },
    Free { pick: u16 },
    Overwrite { pick: u16, len: u16, fill: u8 },
    Fetch { pick: u16 },
    Defragment { window: u8 },
}

#[derive(Debug, Arbitrary)]
struct Input {
    max_open: u8,
    ops: Vec<Op>,
}

fn payload(len: u16, fill: u8, max: usize) -> Vec<u8> {
    let len = (len as usize % max) + 1;
    (0..len).map(|i| fill ^ i as u8).collect()
}

fn pick(model: &HashMap<ObjectHandle, Vec<u8>>, index: u16) -> Option<ObjectHandle> {
    let mut handles: Vec<_> = model.keys().copied().collect();
    handles.sort();
    handles.get(index as usize % handles.len().max(1)).copied()
}

fuzz_target!(|input: Input| {
    let log = Arc::new(Mutex::new(Vec::<Relocation>::new()));
    let sink = Arc::clone(&log);
    let store = ArenaStore::builder()
        .window_size(512)
        .initial_windows(1)
        .max_windows(6)
        .max_open_windows(input.max_open as usize % 3 + 1)
        .relocation_sink(move |r: Relocation| sink.lock().push(r))
        .open()
        .unwrap();
    let max = store.max_payload_len();
    let mut model: HashMap<ObjectHandle, Vec<u8>> = HashMap::new();

    let apply = |model: &mut HashMap<ObjectHandle, Vec<u8>>| {
        for r in log.lock().drain(..) {
            let moved = model.remove(&r.from).expect("relocated handle must be live");
            assert!(model.insert(r.to, moved).is_none());
        }
    };

    for op in input.ops.into_iter().take(256) {
        match op {
            Op::Allocate { len, fill } => {
                let bytes = payload(len, fill, max);
                let result = store.allocate(&bytes);
                apply(&mut model);
                if let Ok(handle) = result {
                    assert!(model.insert(handle, bytes).is_none());
                }
            }
            Op::AllocateRelocating { len, fill } => {
                let bytes = payload(len, fill, max);
                let result = store.allocate_relocating(&bytes);
                let reported: Vec<Relocation> = log.lock().clone();
                apply(&mut model);
                if let Ok(allocation) = result {
                    assert_eq!(allocation.relocations, reported);
                    assert!(model.insert(allocation.handle, bytes).is_none());
                }
            }
            Op::Free { pick: index } => {
                if let Some(handle) = pick(&model, index) {
                    store.free(handle).unwrap();
                    model.remove(&handle);
                }
            }
            Op::Overwrite { pick: index, len, fill } => {
                if let Some(handle) = pick(&model, index) {
                    let bytes = payload(len, fill, max);
                    let result = store.overwrite(handle, &bytes);
                    apply(&mut model);
                    match result {
                        Ok(Overwritten::InPlace(_)) => {
                            model.insert(handle, bytes);
                        }
                        Ok(Overwritten::Relocated { handle: new, previous }) => {
                            store.free(previous).unwrap();
                            model.remove(&previous);
                            model.insert(new, bytes);
                        }
                        Err(_) => {}
                    }
                }
            }
            Op::Fetch { pick: index } => {
                if let Some(handle) = pick(&model, index) {
                    assert_eq!(store.fetch(handle).unwrap(), model[&handle]);
                }
            }
            Op::Defragment { window } => {
                let count = store.stats().unwrap().window_count;
                store.defragment(window as u32 % count).unwrap();
                apply(&mut model);
            }
        }
    }

    store.check_integrity().unwrap();
    let stored: HashMap<_, _> = store.entries().map(|e| e.unwrap()).collect();
    assert_eq!(stored, model);
});
