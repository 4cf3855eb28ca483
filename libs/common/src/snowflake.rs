use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond epoch the timestamp bits count from: 2025-01-01T00:00:00Z.
const EPOCH_MS: u64 = 1_735_689_600_000;

const WORKER_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_WORKER_ID: u64 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct MintState {
    millis: u64,
    sequence: u64,
}

/// Mints 64-bit message ids that sort by creation time.
///
/// Layout (MSB → LSB): 42 timestamp bits, 10 worker bits, 12 per-millisecond
/// sequence bits. Ids minted by one process are strictly increasing, which is
/// what lets a message id double as the `before` cursor when paging room
/// history.
pub struct SnowflakeGenerator {
    worker_id: u64,
    state: Mutex<MintState>,
}

impl SnowflakeGenerator {
    pub fn new(worker_id: u16) -> Self {
        assert!(
            (worker_id as u64) <= MAX_WORKER_ID,
            "worker_id must fit in {WORKER_BITS} bits"
        );
        Self {
            worker_id: worker_id as u64,
            state: Mutex::new(MintState {
                millis: 0,
                sequence: 0,
            }),
        }
    }

    pub fn generate(&self) -> i64 {
        let mut state = self.state.lock().unwrap();

        let mut now = current_ms();
        assert!(
            now >= state.millis,
            "clock moved backwards: last={}, now={now}",
            state.millis
        );

        if now == state.millis {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // 4096 ids inside one millisecond; wait out the tick.
                while now == state.millis {
                    now = current_ms();
                }
            }
        } else {
            state.sequence = 0;
        }
        state.millis = now;

        (((now - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence) as i64
    }
}

fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before Unix epoch")
        .as_millis() as u64
}
