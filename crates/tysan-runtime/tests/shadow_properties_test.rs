use std::collections::HashSet;

use tysan_runtime::shadow::UNKNOWN;
use tysan_runtime::{DescriptorArena, Layout, ShadowMemory, TypeRef};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range_usize(&mut self, low: usize, high_exclusive: usize) -> usize {
        assert!(low < high_exclusive);
        low + (self.next_u64() as usize % (high_exclusive - low))
    }
}

/// x86_64 application ranges: low memory, the PIE binary region and the
/// mmap/stack region.
const X86_64_APP_RANGES: [(usize, usize); 3] = [
    (0x0000_0000_1000, 0x0100_0000_0000),
    (0x5500_0000_0000, 0x5680_0000_0000),
    (0x7e80_0000_0000, 0x8000_0000_0000),
];

#[test]
fn shadow_for_is_injective_over_x86_64_app_ranges() {
    const SEEDS: [u64; 3] = [1, 2, 3];
    const SAMPLES_PER_RANGE: usize = 4_000;
    let mapping = Layout::X86_64.mapping();

    for seed in SEEDS {
        let mut rng = XorShift64::new(seed);
        let mut addrs = HashSet::new();
        let mut slots = HashSet::new();
        for (lo, hi) in X86_64_APP_RANGES {
            for _ in 0..SAMPLES_PER_RANGE {
                let addr = rng.gen_range_usize(lo, hi);
                if addrs.insert(addr) {
                    let slot = mapping.shadow_for(addr);
                    assert!(mapping.contains_slot(slot), "seed={seed}: {addr:#x}");
                    assert!(slots.insert(slot), "seed={seed}: {addr:#x} collides");
                }
            }
            // Range edges.
            for addr in [lo, hi - 1] {
                if addrs.insert(addr) {
                    assert!(slots.insert(mapping.shadow_for(addr)), "{addr:#x}");
                }
            }
        }
        assert_eq!(addrs.len(), slots.len());
    }
}

#[test]
fn shadow_for_is_injective_inside_a_window() {
    let shadow = ShadowMemory::reserve_window(12).unwrap();
    let m = shadow.mapping();
    let base = 0x7f00_1234_0000usize;
    let slots: HashSet<usize> = (0..4096).map(|i| m.shadow_for(base + i)).collect();
    assert_eq!(slots.len(), 4096);
}

#[test]
fn set_type_unknown_round_trip() {
    const SEEDS: [u64; 2] = [5, 6];
    let arena = DescriptorArena::new();
    let types: Vec<TypeRef> = ["a", "b", "c"]
        .into_iter()
        .map(|n| arena.scalar(n).unwrap())
        .collect();

    for seed in SEEDS {
        let mut rng = XorShift64::new(seed);
        let shadow = ShadowMemory::reserve_window(16).unwrap();
        let buf = vec![0u8; 512];
        let p = buf.as_ptr() as usize;

        for _ in 0..64 {
            let at = rng.gen_range_usize(0, 480);
            let len = rng.gen_range_usize(1, 32);
            shadow.set_type(p + at, types[at % types.len()], len);
        }
        let at = rng.gen_range_usize(0, 256);
        let n = rng.gen_range_usize(1, 256);
        shadow.set_type_unknown(p + at, n);
        assert!(
            shadow.raw_slots(p + at, n).iter().all(|&w| w == UNKNOWN),
            "seed={seed}"
        );
    }
}

#[test]
fn copy_types_round_trip() {
    const SEEDS: [u64; 2] = [8, 9];
    let arena = DescriptorArena::new();
    let int = arena.scalar("int").unwrap();
    let pair = arena.structure("Pair", &[(int, 0), (int, 4)]).unwrap();

    for seed in SEEDS {
        let mut rng = XorShift64::new(seed);
        let shadow = ShadowMemory::reserve_window(16).unwrap();
        let buf = vec![0u8; 1024];
        let src = buf.as_ptr() as usize;
        let dst = src + 512;

        let mut at = 0;
        while at + 8 <= 256 {
            let ty = if rng.next_u64() % 2 == 0 { int } else { pair };
            let size = if ty == int { 4 } else { 8 };
            shadow.set_type(src + at, ty, size);
            at += size + rng.gen_range_usize(0, 3);
        }
        let before = shadow.raw_slots(src, 256);
        shadow.copy_types(dst, src, 256);
        assert_eq!(shadow.raw_slots(dst, 256), before, "seed={seed}");
        assert_eq!(shadow.raw_slots(src, 256), before, "seed={seed}");
    }
}
