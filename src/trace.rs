//! Allocation traces, and replaying them through a [`Client`] with
//! correctness checks.
//!
//! A trace is a text file of four header numbers (suggested heap size, number
//! of allocation ids, number of operations, weight), one per line, followed
//! by one operation per line:
//!
//! ```text
//! a <id> <size>    allocate
//! r <id> <size>    resize
//! f <id>           free
//! ```

use crate::client::{Client, Privilege};
use crate::engine::ALIGNMENT;
use crate::error::TraceError;
use crate::region::Region;
use crate::transport::Transport;
use alloc::{collections::BTreeMap, format, string::ToString, vec, vec::Vec};
use core::{fmt, str::FromStr};

/// One line of a trace. Ids name allocations and are below the trace's
/// `num_ids`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceOp {
    /// `a <id> <size>`
    Allocate {
        /// The allocation's id.
        id: usize,
        /// The requested size in bytes.
        size: u32,
    },
    /// `r <id> <size>`
    Resize {
        /// The allocation's id.
        id: usize,
        /// The new size in bytes.
        size: u32,
    },
    /// `f <id>`
    Free {
        /// The allocation's id.
        id: usize,
    },
}

/// A parsed allocation trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace {
    /// Not used by replay.
    pub suggested_heap: u32,
    /// How many distinct ids the trace uses.
    pub num_ids: usize,
    /// Not used by replay.
    pub weight: u32,
    /// The operations in order.
    pub ops: Vec<TraceOp>,
}

fn parse_field<T: FromStr>(
    line: usize,
    field: Option<&str>,
    what: &str,
) -> Result<T, TraceError> {
    let field = field.ok_or_else(|| TraceError::Parse {
        line,
        message: format!("missing {what}"),
    })?;
    field.parse().map_err(|_| TraceError::Parse {
        line,
        message: format!("invalid {what} `{field}`"),
    })
}

impl Trace {
    /// Parse the text of a trace file.
    pub fn parse(text: &str) -> Result<Self, TraceError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, line)| (i + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty());

        let mut header = [0u64; 4];
        for (slot, what) in header.iter_mut().zip([
            "suggested heap size",
            "id count",
            "op count",
            "weight",
        ]) {
            let (line, text) = lines.next().ok_or_else(|| TraceError::Parse {
                line: 0,
                message: format!("missing {what}"),
            })?;
            *slot = parse_field(line, Some(text), what)?;
        }
        let [suggested_heap, num_ids, num_ops, weight] = header;
        let num_ids = usize::try_from(num_ids).map_err(|_| TraceError::Parse {
            line: 2,
            message: "id count out of range".to_string(),
        })?;

        let mut ops = Vec::new();
        for (line, text) in lines {
            let mut fields = text.split_whitespace();
            let kind = fields.next().unwrap_or_default();
            let id: usize = parse_field(line, fields.next(), "id")?;
            if id >= num_ids {
                return Err(TraceError::Parse {
                    line,
                    message: format!("id {id} is not below the id count {num_ids}"),
                });
            }
            let op = match kind {
                "a" => TraceOp::Allocate {
                    id,
                    size: parse_field(line, fields.next(), "size")?,
                },
                "r" => TraceOp::Resize {
                    id,
                    size: parse_field(line, fields.next(), "size")?,
                },
                "f" => TraceOp::Free { id },
                _ => {
                    return Err(TraceError::Parse {
                        line,
                        message: format!("unknown operation `{kind}`"),
                    })
                }
            };
            ops.push(op);
        }

        if ops.len() as u64 != num_ops {
            log::warn!(
                "trace: header announces {num_ops} operations but {} follow",
                ops.len()
            );
        }

        Ok(Trace {
            suggested_heap: u32::try_from(suggested_heap).unwrap_or(u32::MAX),
            num_ids,
            weight: u32::try_from(weight).unwrap_or(u32::MAX),
            ops,
        })
    }
}

impl FromStr for Trace {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Trace::parse(s)
    }
}

/// What a successful replay measured.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TraceReport {
    /// The number of operations replayed.
    pub ops: usize,

    /// The most payload bytes live at any one time.
    pub peak_payload: u64,

    /// The region's size when the trace finished.
    pub heap_size: u32,

    /// `peak_payload / heap_size`.
    pub utilization: f64,
}

impl fmt::Display for TraceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ops, peak payload {} bytes, heap {} bytes, utilization {:.1}%",
            self.ops,
            self.peak_payload,
            self.heap_size,
            self.utilization * 100.0
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct Payload {
    address: u32,
    size: u32,
}

impl Payload {
    fn end(&self) -> u64 {
        u64::from(self.address) + u64::from(self.size)
    }
}

/// The byte every payload of allocation `id` is filled with.
fn pattern(id: usize) -> u8 {
    (id % 251) as u8 + 1
}

struct Replay<'a, T, R, P> {
    client: &'a mut Client<T, R, P>,
    live: BTreeMap<usize, Payload>,
    payload_bytes: u64,
    peak_payload: u64,
}

impl<T, R, P> Replay<'_, T, R, P>
where
    T: Transport,
    R: Region,
    P: Privilege,
{
    fn check(&self, op: usize, id: usize, payload: Payload) -> Result<(), TraceError> {
        let fail = |message: alloc::string::String| TraceError::Check { op, message };
        let region = self.client.region();
        if payload.address < region.base() || payload.end() > u64::from(region.brk()) {
            return Err(fail(format!(
                "payload {:#010x}+{} lies outside the heap {:#010x}..{:#010x}",
                payload.address,
                payload.size,
                region.base(),
                region.brk()
            )));
        }
        if payload.address % ALIGNMENT != 0 {
            return Err(fail(format!(
                "payload {:#010x} is not {ALIGNMENT}-byte aligned",
                payload.address
            )));
        }
        for (other_id, other) in &self.live {
            if *other_id != id
                && u64::from(payload.address) < other.end()
                && u64::from(other.address) < payload.end()
            {
                return Err(fail(format!(
                    "payload {:#010x}+{} of id {id} overlaps id {other_id} at {:#010x}+{}",
                    payload.address, payload.size, other.address, other.size
                )));
            }
        }
        Ok(())
    }

    fn fill(&mut self, op: usize, id: usize, payload: Payload) -> Result<(), TraceError> {
        let bytes = vec![pattern(id); payload.size as usize];
        self.client
            .region_mut()
            .write(payload.address, &bytes)
            .map_err(|e| TraceError::Check {
                op,
                message: e.to_string(),
            })
    }

    /// Check that the first `len` bytes of `payload` still hold `id`'s pattern.
    fn check_contents(
        &self,
        op: usize,
        id: usize,
        payload: Payload,
        len: u32,
    ) -> Result<(), TraceError> {
        let mut bytes = vec![0; len as usize];
        let intact = self
            .client
            .region()
            .read(payload.address, &mut bytes)
            .is_ok()
            && bytes.iter().all(|b| *b == pattern(id));
        if !intact {
            return Err(TraceError::Check {
                op,
                message: format!(
                    "contents of id {id} were not preserved at {:#010x}",
                    payload.address
                ),
            });
        }
        Ok(())
    }

    fn insert(&mut self, op: usize, id: usize, payload: Payload) -> Result<(), TraceError> {
        self.check(op, id, payload)?;
        self.fill(op, id, payload)?;
        self.payload_bytes += u64::from(payload.size);
        self.peak_payload = self.peak_payload.max(self.payload_bytes);
        self.live.insert(id, payload);
        Ok(())
    }

    fn remove(&mut self, id: usize) -> Option<Payload> {
        let payload = self.live.remove(&id)?;
        self.payload_bytes -= u64::from(payload.size);
        Some(payload)
    }

    fn step(&mut self, op: usize, trace_op: TraceOp) -> Result<(), TraceError> {
        let client_error = |source| TraceError::Client { op, source };
        match trace_op {
            TraceOp::Allocate { id, size } => {
                if let Some(old) = self.remove(id) {
                    self.client.deallocate(old.address).map_err(client_error)?;
                }
                let address = self.client.allocate(size).map_err(client_error)?;
                match address {
                    Some(address) => self.insert(op, id, Payload { address, size })?,
                    None if size == 0 => {}
                    None => {
                        return Err(TraceError::Check {
                            op,
                            message: format!("out of memory allocating {size} bytes"),
                        })
                    }
                }
            }
            TraceOp::Resize { id, size } => {
                let old = self.remove(id);
                let address = old.map_or(0, |old| old.address);
                let resized = self.client.resize(address, size).map_err(client_error)?;
                match (old, resized) {
                    (_, None) if size == 0 => {}
                    (Some(old), None) => {
                        self.live.insert(id, old);
                        self.payload_bytes += u64::from(old.size);
                        return Err(TraceError::Check {
                            op,
                            message: format!("out of memory resizing id {id} to {size} bytes"),
                        });
                    }
                    (None, None) => {
                        return Err(TraceError::Check {
                            op,
                            message: format!("out of memory allocating {size} bytes"),
                        })
                    }
                    (old, Some(address)) => {
                        let payload = Payload { address, size };
                        if let Some(old) = old {
                            self.check_contents(op, id, payload, old.size.min(size))?;
                        }
                        self.insert(op, id, payload)?;
                    }
                }
            }
            TraceOp::Free { id } => {
                if let Some(old) = self.remove(id) {
                    self.client.deallocate(old.address).map_err(client_error)?;
                }
            }
        }
        Ok(())
    }
}

/// Run `trace` through `client`, which must already be initialized, checking
/// every returned payload along the way. Allocations still live at the end
/// are freed.
pub fn replay<T, R, P>(client: &mut Client<T, R, P>, trace: &Trace) -> Result<TraceReport, TraceError>
where
    T: Transport,
    R: Region,
    P: Privilege,
{
    let mut replay = Replay {
        client,
        live: BTreeMap::new(),
        payload_bytes: 0,
        peak_payload: 0,
    };
    for (op, trace_op) in trace.ops.iter().enumerate() {
        log::debug!("trace: op {op}: {trace_op:?}");
        replay.step(op, *trace_op)?;
    }

    let heap_size = replay.client.region().heap_size();
    let peak_payload = replay.peak_payload;
    let ops = trace.ops.len();
    let live: Vec<u32> = replay.live.values().map(|p| p.address).collect();
    for address in live {
        replay
            .client
            .deallocate(address)
            .map_err(|source| TraceError::Client { op: ops, source })?;
    }

    Ok(TraceReport {
        ops,
        peak_payload,
        heap_size,
        utilization: if heap_size == 0 {
            0.0
        } else {
            peak_payload as f64 / f64::from(heap_size)
        },
    })
}
