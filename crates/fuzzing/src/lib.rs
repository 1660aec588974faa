//! Shared fuzzing and testing infrastructure for `offload_heap`.

use bincode::{Decode, Encode};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use offload_heap::{
    engine::{aligned_size, Engine, EngineConfig, FitPolicy, IndexConfig, Lookup, ALIGNMENT},
    Client, ClientConfig, Codec, Encoding, Endian, HostSession, Loopback, Region,
    SimulatedRegion,
};
use std::collections::BTreeMap;

/// The size of a test allocation or grow.
//
// Note: a newtype rather than a bare `u32` so that we can give it a default
// mutator that keeps sizes small enough to exercise reuse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Size(u32);

impl Size {
    pub fn new(size: u32) -> Self {
        Size(size)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: u32,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size as usize + 1).unwrap() as u32;
            Ok(())
        })?;

        // Snap to an allocation unit boundary, where splits are exact.
        c.mutation(|_ctx| {
            size.0 -= size.0 % ALIGNMENT;
            Ok(())
        })?;

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size as usize).generate(context)?;
        Ok(Size(size as u32))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, Encode, Decode)]
pub enum Op {
    Allocate { id: u32, size: Size },
    Deallocate { id: u32 },
    Resize { id: u32, size: Size },
    Grow { size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Allocate {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Deallocate {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Resize {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Grow {
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, Encode, Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Allocate { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Allocate { id, .. } | Op::Deallocate { id } | Op::Resize { id, .. } => {
                        *id = new_id;
                    }
                    Op::Grow { .. } => {}
                }
            }
            Ok(())
        })?;

        // Deallocate or resize an existing allocation some time after it was
        // made.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let new_op = if ctx.rng().gen_bool() {
                        Op::Deallocate { id }
                    } else {
                        Op::Resize {
                            id,
                            size: m::default::<Size>().generate(ctx)?,
                        }
                    };
                    let new_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(new_index, new_op);
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

/// Where every test heap starts.
const ORIGIN: u32 = 0x2000_0000;

/// The most a session test's region may grow to.
const REGION_CAPACITY: u32 = 1 << 20;

/// How much a session test's client grows its region by at least.
const CHUNK_SIZE: u32 = 64;

/// A currently-live allocation.
#[derive(Clone, Copy, Debug)]
struct LiveAlloc {
    address: u32,
    /// The requested size, not the block size.
    size: u32,
}

impl LiveAlloc {
    fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size)
    }
}

/// Check that a new allocation is aligned, inside `[lo, hi)`, and disjoint
/// from every other live allocation.
fn check_placement(
    live: &BTreeMap<u32, LiveAlloc>,
    id: u32,
    alloc: LiveAlloc,
    lo: u32,
    hi: u32,
) -> Result<(), String> {
    ensure!(
        alloc.address % ALIGNMENT == 0,
        "allocation {:#010x} is misaligned",
        alloc.address
    );
    ensure!(
        alloc.address >= lo && alloc.end() <= u64::from(hi),
        "allocation {:#010x}+{} is outside the heap {lo:#010x}..{hi:#010x}",
        alloc.address,
        alloc.size
    );
    for (other_id, other) in live {
        ensure!(
            *other_id == id || alloc.end() <= u64::from(other.address) || other.end() <= u64::from(alloc.address),
            "allocation {alloc:?} overlaps live allocation {other_id}: {other:?}",
        );
    }
    Ok(())
}

/// The byte pattern live allocation `id` is filled with.
fn pattern(id: u32) -> u8 {
    (id % 251) as u8 + 1
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last op. Returns `false` if there were none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against the engine directly and through a
    /// full device/host session, under every configuration.
    pub fn run(&self) -> Result<(), String> {
        for policy in FitPolicy::ALL {
            for lookup in [Lookup::Index, Lookup::Linear] {
                let config = EngineConfig::default().policy(policy).lookup(lookup);
                self.run_engine(config)?;
            }
            self.run_engine(EngineConfig::default().policy(policy).index(IndexConfig {
                initial_buckets: 2,
                grow: false,
            }))?;

            for codec in [
                Codec::new(Encoding::Wide, Endian::Little),
                Codec::new(Encoding::Packed, Endian::Big),
            ] {
                self.run_session(codec, EngineConfig::default().policy(policy))?;
            }
        }
        Ok(())
    }

    /// Run these test operations against an engine, growing the heap whenever
    /// an allocation does not fit, and verifying the engine after every op.
    pub fn run_engine(&self, config: EngineConfig) -> Result<(), String> {
        log::debug!("========== Running test operations on {config:?} ==========");

        let mut engine = Engine::new(config);
        engine.init(ORIGIN);
        let mut live = BTreeMap::<u32, LiveAlloc>::new();

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Allocate { id, size } => {
                    if let Some(old) = live.remove(&id) {
                        engine.deallocate(old.address).map_err(|e| e.to_string())?;
                    }
                    let size = size.get();
                    let mut address = engine.allocate(size).map_err(|e| e.to_string())?;
                    if address.is_none() && size > 0 {
                        let increment = aligned_size(size).unwrap();
                        engine.grow(increment).map_err(|e| e.to_string())?;
                        address = engine.allocate(size).map_err(|e| e.to_string())?;
                        ensure!(address.is_some(), "no fit right after growing by {increment}");
                    }
                    if let Some(address) = address {
                        ensure!(size > 0, "zero-sized allocation got {address:#010x}");
                        let alloc = LiveAlloc { address, size };
                        let hi = engine.heap_hi().unwrap();
                        check_placement(&live, id, alloc, ORIGIN, hi)?;
                        live.insert(id, alloc);
                    }
                }

                Op::Deallocate { id } => {
                    if let Some(old) = live.remove(&id) {
                        engine.deallocate(old.address).map_err(|e| e.to_string())?;

                        // Under first fit, allocating the same size again must
                        // land at the freed address or at the start of a free
                        // block it was coalesced into.
                        if config.policy == FitPolicy::FirstFit {
                            let again = engine.allocate(old.size).map_err(|e| e.to_string())?;
                            ensure!(
                                again.is_some_and(|a| a <= old.address),
                                "reallocating {} bytes freed at {:#010x} got {again:?}",
                                old.size,
                                old.address
                            );
                            engine.deallocate(again.unwrap()).map_err(|e| e.to_string())?;
                        }
                    }
                }

                Op::Resize { id, size } => {
                    if let Some(old) = live.get(&id).copied() {
                        let size = size.get().max(1);
                        if let Some(address) =
                            engine.resize(old.address, size).map_err(|e| e.to_string())?
                        {
                            ensure!(
                                address == old.address,
                                "in-place resize moved {:#010x} to {address:#010x}",
                                old.address
                            );
                            live.insert(id, LiveAlloc { address, size });
                        } else {
                            ensure!(
                                size > old.size,
                                "shrinking {:#010x} from {} to {size} failed",
                                old.address,
                                old.size
                            );
                        }
                    }
                }

                Op::Grow { size } => {
                    if let Some(increment) = aligned_size(size.get()) {
                        engine.grow(increment).map_err(|e| e.to_string())?;
                    }
                }
            }

            engine.verify().map_err(|e| e.to_string())?;
            for (id, alloc) in &live {
                ensure!(
                    engine
                        .blocks()
                        .any(|b| b.allocated && b.address == alloc.address && b.size >= alloc.size),
                    "live allocation {id} at {:#010x} has no matching block",
                    alloc.address
                );
            }
        }

        for alloc in live.values() {
            engine.deallocate(alloc.address).map_err(|e| e.to_string())?;
        }
        engine.verify().map_err(|e| e.to_string())?;
        ensure!(
            engine.blocks().count() <= 1,
            "a fully freed heap should be a single free block"
        );
        Ok(())
    }

    /// Run these test operations through a device client talking to a host
    /// session over a loopback, checking payload contents along the way.
    pub fn run_session(&self, codec: Codec, config: EngineConfig) -> Result<(), String> {
        log::debug!("========== Running test operations over {codec} ==========");

        let client_config = ClientConfig::default()
            .codec(codec)
            .initial_heap(CHUNK_SIZE)
            .chunk_size(CHUNK_SIZE);
        let session = HostSession::new(codec, config);
        let loopback = Loopback::new(session).map_err(|e| e.to_string())?;
        let mut client = Client::new(
            loopback,
            SimulatedRegion::new(ORIGIN, REGION_CAPACITY),
            client_config,
        );
        client.init().map_err(|e| e.to_string())?;

        let mut live = BTreeMap::<u32, LiveAlloc>::new();

        // Whether growing the region for `size` bytes would overrun it.
        let exhausted = |client: &Client<Loopback, SimulatedRegion>, size: u32| {
            let increment = aligned_size(size).map_or(u64::MAX, |s| u64::from(s.max(CHUNK_SIZE)));
            u64::from(client.region().brk()) + increment
                > u64::from(ORIGIN) + u64::from(REGION_CAPACITY)
        };

        // Fill an allocation with its id's pattern.
        let fill = |client: &mut Client<Loopback, SimulatedRegion>, id: u32, alloc: LiveAlloc| {
            let bytes = vec![pattern(id); alloc.size as usize];
            client
                .region_mut()
                .write(alloc.address, &bytes)
                .map_err(|e| e.to_string())
        };

        // Check that the first `len` bytes at `address` hold `id`'s pattern.
        let check_contents = |client: &Client<Loopback, SimulatedRegion>,
                              id: u32,
                              address: u32,
                              len: u32|
         -> Result<(), String> {
            let mut bytes = vec![0; len as usize];
            client
                .region()
                .read(address, &mut bytes)
                .map_err(|e| e.to_string())?;
            ensure!(
                bytes.iter().all(|b| *b == pattern(id)),
                "contents of allocation {id} were not preserved at {address:#010x}",
            );
            Ok(())
        };

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Allocate { id, size } => {
                    if let Some(old) = live.remove(&id) {
                        client.deallocate(old.address).map_err(|e| e.to_string())?;
                    }
                    let size = size.get();
                    if let Some(address) = client.allocate(size).map_err(|e| e.to_string())? {
                        let alloc = LiveAlloc { address, size };
                        check_placement(&live, id, alloc, ORIGIN, client.region().brk())?;
                        fill(&mut client, id, alloc)?;
                        live.insert(id, alloc);
                    } else {
                        ensure!(
                            size == 0 || exhausted(&client, size),
                            "out of memory allocating {size} bytes"
                        );
                    }
                }

                Op::Deallocate { id } => {
                    if let Some(old) = live.remove(&id) {
                        client.deallocate(old.address).map_err(|e| e.to_string())?;
                    }
                }

                Op::Resize { id, size } => {
                    if let Some(old) = live.remove(&id) {
                        let size = size.get();
                        match client
                            .resize(old.address, size)
                            .map_err(|e| e.to_string())?
                        {
                            Some(address) => {
                                let alloc = LiveAlloc { address, size };
                                check_contents(&client, id, address, old.size.min(size))?;
                                check_placement(&live, id, alloc, ORIGIN, client.region().brk())?;
                                fill(&mut client, id, alloc)?;
                                live.insert(id, alloc);
                            }
                            None => {
                                ensure!(
                                    size == 0 || exhausted(&client, size),
                                    "out of memory resizing to {size} bytes"
                                );
                                if size > 0 {
                                    live.insert(id, old);
                                }
                            }
                        }
                    }
                }

                // The client grows on demand only.
                Op::Grow { .. } => {}
            }

            let engine = client.transport().session().engine();
            engine.verify().map_err(|e| e.to_string())?;
            ensure!(
                engine.heap_hi() == Some(client.region().brk()),
                "host brk {:?} disagrees with device brk {:#010x}",
                engine.heap_hi(),
                client.region().brk()
            );
            for (id, alloc) in &live {
                check_contents(&client, *id, alloc.address, alloc.size)?;
            }
        }

        client.finish().map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    #[test]
    fn first_fit_scenario_over_a_session() {
        let _ = env_logger::try_init();
        let ops = Ops::new([
            Op::Allocate {
                id: 0,
                size: Size::new(16),
            },
            Op::Allocate {
                id: 1,
                size: Size::new(16),
            },
            Op::Deallocate { id: 0 },
            Op::Allocate {
                id: 2,
                size: Size::new(32),
            },
        ]);
        for codec in [
            Codec::new(Encoding::Wide, Endian::Little),
            Codec::new(Encoding::Packed, Endian::Big),
        ] {
            ops.run_session(codec, EngineConfig::default()).unwrap();
        }
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple allocate/deallocate pair.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: Size::new(8),
                },
                Op::Deallocate { id: 0 },
            ]),
            // Zero-sized allocation.
            Ops::new([Op::Allocate {
                id: 0,
                size: Size::new(0),
            }]),
            // Grow in place, then shrink in place.
            Ops::new([
                Op::Grow {
                    size: Size::new(256),
                },
                Op::Allocate {
                    id: 0,
                    size: Size::new(16),
                },
                Op::Resize {
                    id: 0,
                    size: Size::new(100),
                },
                Op::Resize {
                    id: 0,
                    size: Size::new(8),
                },
            ]),
            // Resize that has to move past a neighbour.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: Size::new(24),
                },
                Op::Allocate {
                    id: 1,
                    size: Size::new(24),
                },
                Op::Resize {
                    id: 0,
                    size: Size::new(300),
                },
                Op::Deallocate { id: 1 },
            ]),
            // Free both neighbours of a block, then the block.
            Ops::new([
                Op::Allocate {
                    id: 0,
                    size: Size::new(40),
                },
                Op::Allocate {
                    id: 1,
                    size: Size::new(40),
                },
                Op::Allocate {
                    id: 2,
                    size: Size::new(40),
                },
                Op::Deallocate { id: 0 },
                Op::Deallocate { id: 2 },
                Op::Deallocate { id: 1 },
                Op::Allocate {
                    id: 3,
                    size: Size::new(200),
                },
            ]),
        ];

        match Check::new().iters(2_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| ops.run(),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }
}
