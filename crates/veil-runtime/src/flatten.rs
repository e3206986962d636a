//! Control-flow flattening as a builder/interpreter.
//!
//! User logic is declared as blocks - `(id, body)` pairs where the body
//! returns a [`Step`] naming its terminal transition - and executed by
//! a dispatch loop over an encrypted state word. Block IDs never appear
//! in the dispatch table; they are mapped through a keyed hash
//! ([`veil_core::flow::derive_state`]) to sparse values. A palette of
//! dead states forms a closed cycle reachable from no real entry,
//! inflating the apparent branching complexity.
//!
//! The `Step` type is the whole safety story: a block *cannot* fall off
//! its end without a transition, because its only way to return is to
//! name one. The loop itself carries two guarantees:
//!
//! - an unknown state value (corruption, a `Goto` to an undeclared id)
//!   terminates the dispatch with the default result, never loops;
//! - a hard ceiling of [`ITERATION_CEILING`] dispatch cycles bounds the
//!   loop even if the state is forced into a cycle - deliberate
//!   mis-execution is traded for guaranteed termination.

use veil_core::flow::{derive_dead, derive_state};

use core::hint::black_box;

/// Hard upper bound on dispatch cycles.
pub const ITERATION_CEILING: u32 = 16384;

const DEAD_COUNT: u32 = 6;

/// Terminal transition of a block. Every block body returns exactly one.
pub enum Step<R> {
    /// Unconditional transition.
    Goto(u32),
    /// Unconditional transition routed through an opaque-true check, so
    /// the dispatch looks conditional to a static analyzer.
    GotoObf(u32),
    /// Two-way conditional transition.
    Branch {
        cond: bool,
        if_true: u32,
        if_false: u32,
    },
    /// Conditional transition where both arms route through opaque
    /// predicates with dead-state decoys on the never-taken side.
    BranchObf {
        cond: bool,
        if_true: u32,
        if_false: u32,
    },
    /// Multiway transition: first matching arm, else the default block.
    Switch {
        value: i64,
        arms: Vec<(i64, u32)>,
        default: u32,
    },
    /// Finish the dispatch with a result.
    Return(R),
    /// Finish the dispatch with the default result.
    Exit,
}

type Block<'a, S, R> = Box<dyn FnMut(&mut S) -> Step<R> + 'a>;

/// A flattened function: shared state `S`, result `R`.
pub struct FlatFn<'a, S, R> {
    seed: u32,
    key: u32,
    blocks: Vec<(u32, Block<'a, S, R>)>,
    dead: Vec<u32>,
}

impl<'a, S, R: Default> FlatFn<'a, S, R> {
    /// Fresh dispatcher with entropy-derived seed and state key.
    pub fn new() -> Self {
        Self::with_seed(crate::entropy::rand_u32() ^ crate::BUILD_SEED as u32)
    }

    /// Deterministic seed, for reproducible layouts.
    pub fn with_seed(seed: u32) -> Self {
        let key = seed
            .wrapping_mul(0x9E37_79B9)
            .rotate_left(13)
            .wrapping_add(0x045D_9F3B);
        Self {
            seed,
            key,
            blocks: Vec::new(),
            dead: (0..DEAD_COUNT).map(|i| derive_dead(i, seed)).collect(),
        }
    }

    /// Declare a block. IDs are arbitrary small integers, unique per
    /// dispatcher.
    pub fn block(mut self, id: u32, body: impl FnMut(&mut S) -> Step<R> + 'a) -> Self {
        let value = derive_state(id, self.seed);
        assert!(
            !self.blocks.iter().any(|(v, _)| *v == value),
            "duplicate block id {id}"
        );
        // a dead state colliding with a real block would make the dead
        // cycle reachable; drop it from the palette instead
        self.dead.retain(|&d| d != value);
        self.blocks.push((value, Box::new(body)));
        self
    }

    /// Run the dispatch loop from the block named `entry`.
    pub fn run(&mut self, entry: u32, state: &mut S) -> R {
        self.run_encoded(derive_state(entry, self.seed), state)
    }

    /// Run from a raw dispatch value. Exposed so corruption paths are
    /// testable; normal callers use [`run`](Self::run).
    #[doc(hidden)]
    pub fn run_encoded(&mut self, dispatch: u32, state: &mut S) -> R {
        let key = self.key;
        let mut encoded = dispatch ^ key;
        let mut iterations = 0u32;

        while iterations < ITERATION_CEILING {
            iterations += 1;
            let decoded = black_box(encoded) ^ key;

            if let Some(pos) = self.blocks.iter().position(|(v, _)| *v == decoded) {
                let step = (self.blocks[pos].1)(state);
                let next = match step {
                    Step::Goto(id) => derive_state(id, self.seed),
                    Step::GotoObf(id) => {
                        if crate::opaque::opaque_true(crate::entropy::rand_u32() % 64) {
                            derive_state(id, self.seed)
                        } else {
                            self.dead_or_exit(0)
                        }
                    }
                    Step::Branch {
                        cond,
                        if_true,
                        if_false,
                    } => derive_state(if cond { if_true } else { if_false }, self.seed),
                    Step::BranchObf {
                        cond,
                        if_true,
                        if_false,
                    } => {
                        let flavor = crate::entropy::rand_u32() % 64;
                        if black_box(cond) {
                            if crate::opaque::opaque_true(flavor) {
                                derive_state(if_true, self.seed)
                            } else {
                                self.dead_or_exit(0)
                            }
                        } else if crate::opaque::opaque_true(flavor.wrapping_add(1)) {
                            derive_state(if_false, self.seed)
                        } else {
                            self.dead_or_exit(1)
                        }
                    }
                    Step::Switch {
                        value,
                        arms,
                        default,
                    } => {
                        let target = arms
                            .iter()
                            .find(|(v, _)| *v == value)
                            .map(|&(_, b)| b)
                            .unwrap_or(default);
                        derive_state(target, self.seed)
                    }
                    Step::Return(r) => return r,
                    Step::Exit => return R::default(),
                };
                encoded = next ^ key;
            } else if let Some(index) = self.dead.iter().position(|&d| d == decoded) {
                encoded = self.dead_body(index as u32, iterations) ^ key;
            } else {
                // state the table has no entry for: terminal, never a spin
                return R::default();
            }
        }

        R::default()
    }

    fn dead_or_exit(&self, index: usize) -> u32 {
        // palette entries can be dropped on collision; fall back to a
        // value outside both palettes, which terminates via the default
        self.dead.get(index).copied().unwrap_or(0)
    }

    /// Dead-state bodies: junk work, then the next state in the closed
    /// cycle 0→1→2→3→{4|0}→5→0. Unreachable from any real entry.
    fn dead_body(&self, index: u32, iterations: u32) -> u32 {
        let next = match index {
            0 => {
                let mut h = black_box(0x811C_9DC5u32);
                h ^= iterations;
                h = h.wrapping_mul(0x0100_0193);
                black_box(h ^ (h >> 16));
                1
            }
            1 => {
                let mut acc = 0i32;
                for i in 0..3 {
                    acc = black_box(acc.wrapping_mul(31).wrapping_add(i));
                }
                2
            }
            2 => {
                let mut x = black_box(iterations);
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                black_box(x);
                3
            }
            3 => {
                if black_box(iterations) & 0xFF > 128 {
                    4
                } else {
                    0
                }
            }
            4 => {
                let probe = black_box(0u8);
                black_box(&probe as *const u8 as usize & 0xFF);
                5
            }
            _ => {
                let mut m = black_box(iterations).wrapping_mul(0x045D_9F3B);
                m ^= m >> 16;
                black_box(m.wrapping_add(0x119D_E1F3));
                0
            }
        };
        self.dead_or_exit(next as usize)
    }
}

impl<S, R: Default> Default for FlatFn<'_, S, R> {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straight_line_arithmetic() {
        struct St {
            x: u64,
        }
        let mut flat = FlatFn::with_seed(0x1234_5678)
            .block(0, |s: &mut St| {
                s.x = s.x * 2;
                Step::Goto(1)
            })
            .block(1, |s: &mut St| {
                s.x += 5;
                Step::Goto(2)
            })
            .block(2, |s: &mut St| Step::Return(s.x));
        let mut st = St { x: 10 };
        assert_eq!(flat.run(0, &mut st), 25);
    }

    #[test]
    fn branches_take_both_arms() {
        let mut flat = FlatFn::with_seed(99)
            .block(0, |x: &mut u64| Step::Branch {
                cond: *x > 50,
                if_true: 1,
                if_false: 2,
            })
            .block(1, |_| Step::Return(1u64))
            .block(2, |_| Step::Return(2u64));
        let mut big = 100u64;
        let mut small = 3u64;
        assert_eq!(flat.run(0, &mut big), 1);
        assert_eq!(flat.run(0, &mut small), 2);
    }

    #[test]
    fn loop_block_accumulates() {
        // sum 1..=n through a loop-shaped graph
        struct St {
            i: u64,
            n: u64,
            total: u64,
        }
        let mut flat = FlatFn::with_seed(7)
            .block(0, |s: &mut St| Step::Branch {
                cond: s.i <= s.n,
                if_true: 1,
                if_false: 2,
            })
            .block(1, |s: &mut St| {
                s.total += s.i;
                s.i += 1;
                Step::GotoObf(0)
            })
            .block(2, |s: &mut St| Step::Return(s.total));
        let mut st = St { i: 1, n: 100, total: 0 };
        assert_eq!(flat.run(0, &mut st), 5050);
    }

    #[test]
    fn switch_dispatches_and_defaults() {
        let mut flat = FlatFn::with_seed(41)
            .block(0, |v: &mut i64| Step::Switch {
                value: *v,
                arms: vec![(1, 10), (2, 20)],
                default: 30,
            })
            .block(10, |_| Step::Return(100i64))
            .block(20, |_| Step::Return(200i64))
            .block(30, |_| Step::Return(-1i64));
        assert_eq!(flat.run(0, &mut 1), 100);
        assert_eq!(flat.run(0, &mut 2), 200);
        assert_eq!(flat.run(0, &mut 9), -1);
    }

    #[test]
    fn obfuscated_branch_matches_plain_branch() {
        for input in [0u64, 1, 49, 50, 51, 1000] {
            let mut flat = FlatFn::with_seed(5)
                .block(0, |x: &mut u64| Step::BranchObf {
                    cond: *x >= 50,
                    if_true: 1,
                    if_false: 2,
                })
                .block(1, |_| Step::Return(true))
                .block(2, |_| Step::Return(false));
            let mut v = input;
            assert_eq!(flat.run(0, &mut v), input >= 50);
        }
    }

    #[test]
    fn unknown_state_terminates_with_default() {
        let mut calls = 0u32;
        let mut flat = FlatFn::with_seed(11).block(0, |_: &mut ()| {
            calls += 1;
            Step::Goto(999) // never declared: simulated state corruption
        });
        let result: u64 = flat.run(0, &mut ());
        assert_eq!(result, 0);
        drop(flat);
        assert_eq!(calls, 1, "corrupted dispatch must not re-enter blocks");
    }

    #[test]
    fn corrupted_raw_state_terminates() {
        let mut flat: FlatFn<(), u64> =
            FlatFn::with_seed(13).block(0, |_: &mut ()| Step::Return(7));
        // a dispatch value in neither palette
        assert_eq!(flat.run_encoded(0xDEAD_BEEF, &mut ()), 0);
    }

    #[test]
    fn dead_cycle_entry_hits_ceiling_and_terminates() {
        let mut flat: FlatFn<(), u64> =
            FlatFn::with_seed(17).block(0, |_: &mut ()| Step::Return(7));
        let dead0 = veil_core::flow::derive_dead(0, 17);
        // forced into the unreachable cycle: must still terminate
        assert_eq!(flat.run_encoded(dead0, &mut ()), 0);
    }

    #[test]
    fn infinite_goto_cycle_bounded_by_ceiling() {
        let mut count = 0u32;
        let mut flat = FlatFn::with_seed(23)
            .block(0, |_: &mut ()| {
                count += 1;
                Step::Goto(1)
            })
            .block(1, |_: &mut ()| Step::Goto(0));
        let r: u64 = flat.run(0, &mut ());
        assert_eq!(r, 0);
        drop(flat);
        assert!(count <= ITERATION_CEILING, "ceiling exceeded: {count}");
        assert!(count >= ITERATION_CEILING / 2 - 1, "loop ended early: {count}");
    }

    #[test]
    fn entropy_seeded_dispatcher_works() {
        let mut flat = FlatFn::new()
            .block(3, |x: &mut u32| {
                *x ^= 0xAA;
                Step::Goto(9)
            })
            .block(9, |x: &mut u32| Step::Return(*x));
        let mut v = 0x55u32;
        assert_eq!(flat.run(3, &mut v), 0xFF);
    }

    #[test]
    #[should_panic(expected = "duplicate block id")]
    fn duplicate_ids_rejected() {
        let _ = FlatFn::<(), u64>::with_seed(1)
            .block(4, |_| Step::Exit)
            .block(4, |_| Step::Exit);
    }
}
