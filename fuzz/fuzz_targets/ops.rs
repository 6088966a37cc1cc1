#![no_main]

use brk_heap_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

/// Arena capacities each input is run against: one that rarely fills up, and
/// one small enough that growth fails and the heap has to live off its free
/// list.
const ARENA_CAPACITIES: [usize; 2] = [1 << 20, 4 << 10];

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(&data[..size]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    // Re-encode, dropping ops off the end until the result fits in `data`.
    loop {
        if let Ok(new_size) = bincode::encode_into_slice(&ops, data, bincode_config()) {
            return new_size;
        }
        if !ops.pop() {
            return fuzzer_mutate(data, size, max_size);
        }
    }
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    let Some(ops) = decode(data) else {
        return;
    };
    for capacity in ARENA_CAPACITIES {
        if let Err(e) = ops.run(capacity) {
            panic!("error with a {capacity}-byte arena: {e}");
        }
    }
});
