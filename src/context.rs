use std::io::Write;

use burn::tensor::backend::Backend;
use log::{info, warn, LevelFilter};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::args::TrainingArguments;

/// The state every component of a run gets handed over: who we are in a
/// distributed run and where randomness comes from.
#[derive(Debug)]
pub struct RunContext {
    /// rank of this process in a distributed run (-1 when not distributed)
    pub local_rank: i64,
    /// the seed of the run
    pub seed: u64,
    /// the generator all run-level randomness is drawn from
    rng: StdRng,
}

impl RunContext {
    /// Creates a context without touching logging nor the backend
    pub fn new(local_rank: i64, seed: u64) -> Self {
        Self { local_rank, seed, rng: StdRng::seed_from_u64(seed) }
    }

    /// Sets up logging, seeds the backend and reports on the process.
    pub fn init<B: Backend>(args: &TrainingArguments) -> Self {
        init_logging(args.local_rank);

        warn!(
            "Process rank: {}, device: {}, n_gpu: {}, distributed training: {}, 16-bits training: {}",
            args.local_rank,
            args.device(),
            args.n_gpu(),
            args.is_distributed(),
            args.fp16,
        );
        info!("Training/evaluation parameters {:?}", args);

        B::seed(args.seed);
        Self::new(args.local_rank, args.seed)
    }

    pub fn is_primary(&self) -> bool {
        crate::args::is_primary_rank(self.local_rank)
    }

    /// Draws a fresh seed for a component that owns its own generator
    pub fn next_seed(&mut self) -> u64 {
        self.rng.gen()
    }
}

/// Only the primary process logs at INFO level, the others only warn.
pub fn log_level(local_rank: i64) -> LevelFilter {
    if crate::args::is_primary_rank(local_rank) { LevelFilter::Info } else { LevelFilter::Warn }
}

/// Installs the run's logger, unless one is already there
pub fn init_logging(local_rank: i64) {
    // a logger may already be installed (tests, embedding program)
    let _ = env_logger::Builder::new()
        .filter_level(log_level(local_rank))
        .parse_default_env()
        .format(|buf, record| {
            writeln!(buf, "{} - {} - {} -   {}", buf.timestamp_seconds(), record.level(), record.target(), record.args())
        })
        .try_init();
}
