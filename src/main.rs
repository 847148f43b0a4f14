use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use fastrace::collector::ConsoleReporter;
use fastrace::local::LocalSpan;
use fastrace::prelude::*;
use kvslots::host_store::HostKvStore;
use kvslots::logging::{self, LoggingConfig};
use kvslots::runner::{GenerateRequest, Generation, Runner, SyntheticModel};
use kvslots::{CacheError, Config, Embedding, Input, InputCache, SharedInputCache};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

const DEFAULT_KV_SIZE: usize = 2048;
const DEFAULT_PARALLEL: usize = 4;
const VOCAB_SIZE: usize = 32000;
const RETRY_BACKOFF: Duration = Duration::from_millis(2);
const MAX_ATTEMPTS: usize = 5000;

#[derive(Parser)]
#[command(name = "kvslots", about = "Replay a shared-prefix workload through the KV slot cache")]
struct Args {
    /// JSON cache config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Total cached positions across all slots
    #[arg(long)]
    kv_size: Option<usize>,

    /// Number of slots
    #[arg(long)]
    parallel: Option<usize>,

    /// Positions a context shift always keeps
    #[arg(long)]
    num_keep: Option<usize>,

    /// Best-fit slot selection with prefix forking
    #[arg(long)]
    multi_user: bool,

    #[arg(long, default_value_t = 64)]
    requests: usize,

    /// Distinct shared prefixes in the workload
    #[arg(long, default_value_t = 4)]
    prefixes: usize,

    #[arg(long, default_value_t = 96)]
    prefix_len: usize,

    #[arg(long, default_value_t = 32)]
    max_tokens: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Use a store that cannot remove from the middle of a sequence
    #[arg(long)]
    no_shift: bool,

    /// Print spans to stdout
    #[arg(long)]
    trace: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(DEFAULT_KV_SIZE, DEFAULT_PARALLEL),
    };
    if let Some(kv_size) = args.kv_size {
        config.kv_size = kv_size;
    }
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    if let Some(num_keep) = args.num_keep {
        config.num_keep = num_keep;
    }
    config.multi_user_cache |= args.multi_user;
    config.validate()?;
    Ok(config)
}

/// Prompts built from a few shared prefixes (every other one led by an image
/// embedding), a random suffix each, and now and then an exact repeat.
fn build_workload(args: &Args) -> Vec<GenerateRequest> {
    let mut rng = StdRng::seed_from_u64(args.seed);

    let prefixes: Vec<Vec<Input>> = (0..args.prefixes.max(1))
        .map(|i| {
            let mut prefix = Vec::with_capacity(args.prefix_len + 1);
            if i % 2 == 0 {
                let values = (0..16).map(|_| rng.random_range(-1.0f32..1.0)).collect();
                prefix.push(Input::Image(Embedding::new(values)));
            }
            prefix.extend((0..args.prefix_len).map(|_| Input::Token(rng.random_range(0..VOCAB_SIZE as i32))));
            prefix
        })
        .collect();

    let mut requests: Vec<GenerateRequest> = Vec::with_capacity(args.requests);
    for _ in 0..args.requests {
        if !requests.is_empty() && rng.random_range(0..4) == 0 {
            let again = requests[rng.random_range(0..requests.len())].clone();
            requests.push(again);
            continue;
        }
        let mut prompt = prefixes[rng.random_range(0..prefixes.len())].clone();
        let suffix_len = rng.random_range(4..48);
        prompt.extend((0..suffix_len).map(|_| Input::Token(rng.random_range(0..VOCAB_SIZE as i32))));
        requests.push(GenerateRequest {
            prompt,
            max_tokens: args.max_tokens,
            cache_prompt: true,
        });
    }
    requests
}

/// Run one request on the blocking pool, backing off while every slot is
/// busy.
async fn run_request(runner: Runner<SyntheticModel>, id: usize, req: GenerateRequest) -> Result<Generation> {
    for _ in 0..MAX_ATTEMPTS {
        let worker = runner.clone();
        let request = req.clone();
        let result = tokio::task::spawn_blocking(move || {
            let root = Span::root("request", SpanContext::random());
            let _guard = root.set_local_parent();
            LocalSpan::add_property(|| ("request_id", id.to_string()));
            worker.generate(&request)
        })
        .await?;

        match result {
            Err(CacheError::NoCandidateSlot) => tokio::time::sleep(RETRY_BACKOFF).await,
            other => return Ok(other?),
        }
    }
    bail!("request {id}: no cache slot became available after {MAX_ATTEMPTS} attempts")
}

#[derive(Default)]
struct Stats {
    completed: usize,
    failed: usize,
    prompt_inputs: usize,
    cached_inputs: usize,
    processed: usize,
    generated: usize,
    shifts: usize,
    reprocessed: usize,
}

impl Stats {
    fn record(&mut self, prompt_len: usize, generation: &Generation) {
        self.completed += 1;
        self.prompt_inputs += prompt_len;
        self.cached_inputs += generation.num_past;
        self.processed += generation.processed;
        self.generated += generation.tokens.len();
        self.shifts += generation.shifts;
        self.reprocessed += generation.reprocessed;
    }

    fn hit_rate(&self) -> f64 {
        if self.prompt_inputs == 0 {
            return 0.0;
        }
        self.cached_inputs as f64 / self.prompt_inputs as f64 * 100.0
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(LoggingConfig::new(&args.log_level));

    if args.trace {
        fastrace::set_reporter(ConsoleReporter, fastrace::collector::Config::default());
        info!("Tracing enabled: console reporter");
    }

    let config = build_config(&args)?;
    let model = SyntheticModel::new(4, 8, VOCAB_SIZE);
    let store = if args.no_shift {
        HostKvStore::without_shift()
    } else {
        HostKvStore::new()
    };
    let cache = InputCache::new(&config, store, &model.backend())?;
    let runner = Runner::new(SharedInputCache::new(cache), model, config.batch_size, config.num_keep);

    let workload = build_workload(&args);
    info!(
        "Replaying workload: requests={}, prefixes={}, prefix_len={}, max_tokens={}, shift={}",
        workload.len(),
        args.prefixes,
        args.prefix_len,
        args.max_tokens,
        !args.no_shift
    );

    let start = Instant::now();
    let mut handles = Vec::with_capacity(workload.len());
    for (id, req) in workload.into_iter().enumerate() {
        let prompt_len = req.prompt.len();
        let handle = tokio::spawn(run_request(runner.clone(), id, req));
        handles.push((id, prompt_len, handle));
    }

    let mut stats = Stats::default();
    for (id, prompt_len, handle) in handles {
        match handle.await? {
            Ok(generation) => {
                debug!(
                    "request {} done: slot={}, prompt={}, cached={}, generated={}",
                    id,
                    generation.slot_id,
                    prompt_len,
                    generation.num_past,
                    generation.tokens.len()
                );
                stats.record(prompt_len, &generation);
            }
            Err(e) => {
                warn!("request {id} failed: {e:#}");
                stats.failed += 1;
            }
        }
    }

    info!(
        "Workload done: completed={}, failed={}, hit_rate={:.1}%, cached={}/{}, processed={}, generated={}, shifts={}, reprocessed={}, elapsed_ms={}",
        stats.completed,
        stats.failed,
        stats.hit_rate(),
        stats.cached_inputs,
        stats.prompt_inputs,
        stats.processed,
        stats.generated,
        stats.shifts,
        stats.reprocessed,
        start.elapsed().as_millis()
    );

    runner.cache().with(|cache| {
        info!("Closing cache: resident cells={}", cache.store().used_cells());
        cache.close();
    });

    if args.trace {
        fastrace::flush();
    }
    Ok(())
}
