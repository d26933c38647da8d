// SPDX-License-Identifier: MIT OR Apache-2.0

//! rwkv-chain CLI: interactive chat over an RWKV-6 model.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rwkv_chain::{
    ChainTokenizer, ChatConfig, GenerationLoop, HostRuntime, PrefillPolicy, PromptMode, Session,
    StreamDecoder,
};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Vocabulary files looked for in the model directory when `--tokenizer`
/// is not given.
const TOKENIZER_CANDIDATES: &[&str] = &["tokenizer.json", "rwkv_vocab_v20230424.txt"];

#[derive(Parser)]
#[command(name = "rwkv-chain")]
#[command(about = "Chat with an RWKV model run as a chain of sub-networks")]
#[command(version)]
struct Cli {
    /// Model directory (`config.json` + safetensors)
    #[arg(short, long)]
    model: PathBuf,

    /// Tokenizer file (`tokenizer.json` or RWKV `.txt` vocabulary)
    #[arg(short, long)]
    tokenizer: Option<PathBuf>,

    /// Device ids, comma separated (e.g. `0,1`)
    #[arg(long, value_delimiter = ',')]
    devid: Option<Vec<usize>>,

    /// `greedy` or `penalty_sample`
    #[arg(long)]
    generation_mode: Option<String>,

    /// Softmax temperature (penalty_sample)
    #[arg(long)]
    temperature: Option<f32>,

    /// Nucleus mass (penalty_sample)
    #[arg(long)]
    top_p: Option<f32>,

    /// Repetition penalty (penalty_sample)
    #[arg(long)]
    repeat_penalty: Option<f32>,

    /// How many recent tokens are penalized (penalty_sample)
    #[arg(long)]
    repeat_last_n: Option<usize>,

    /// Generated tokens per turn
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// `prompted` (chat template) or `unprompted` (raw text)
    #[arg(long)]
    prompt_mode: Option<String>,

    /// Keep the conversation state between turns
    #[arg(long)]
    enable_history: bool,

    /// RNG seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,

    /// JSON configuration file; flags override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Overlay the flags that were given onto `config`.
    fn apply(&self, config: &mut ChatConfig) -> Result<()> {
        if let Some(devices) = &self.devid {
            config.devices.clone_from(devices);
        }
        if let Some(mode) = &self.generation_mode {
            config.generation_mode.clone_from(mode);
        }
        if let Some(t) = self.temperature {
            config.sampling.temperature = t;
        }
        if let Some(p) = self.top_p {
            config.sampling.top_p = p;
        }
        if let Some(r) = self.repeat_penalty {
            config.sampling.repeat_penalty = r;
        }
        if let Some(n) = self.repeat_last_n {
            config.sampling.repeat_last_n = n;
        }
        if let Some(n) = self.max_new_tokens {
            config.generation.max_new_tokens = n;
        }
        if let Some(mode) = &self.prompt_mode {
            config.generation.prompt_mode = mode.parse::<PromptMode>()?;
        }
        if self.enable_history {
            config.session.prefill_policy = PrefillPolicy::Continue;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => ChatConfig::from_file(path)?,
        None => ChatConfig::default(),
    };
    cli.apply(&mut config)?;
    let sampler = config.sampler()?;

    // --- Model ---
    let mut rt = HostRuntime::request(&config.devices)?;
    let model = rwkv_chain::rwkv::load_model_dir(&mut rt, &cli.model)
        .with_context(|| format!("loading {}", cli.model.display()))?;
    let tokenizer_path = resolve_tokenizer(cli.tokenizer.as_deref(), &cli.model)?;
    let tokenizer = ChainTokenizer::from_path(&tokenizer_path)?;
    if tokenizer.vocab_size() > model.vocab_size {
        warn!(
            tokenizer = tokenizer.vocab_size(),
            model = model.vocab_size,
            "tokenizer vocabulary is larger than the model's"
        );
    }

    let mut session = Session::new(rt, config.session)?;
    let mut chat = GenerationLoop::new(sampler, config.generation.clone());
    info!(
        mode = %config.generation_mode,
        policy = %config.session.prefill_policy,
        max_new_tokens = config.generation.max_new_tokens,
        "ready; type `reset` to clear the context, `exit` to quit"
    );

    // --- Chat loop ---
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!("User: ");
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        match text {
            "" => continue,
            "exit" => break,
            "reset" => {
                session.reset();
                println!("(context cleared)");
                continue;
            }
            _ => {}
        }

        print!("Assistant:");
        stdout.flush()?;
        let mut stream = StreamDecoder::new();
        let outcome = chat.generate(&mut session, &tokenizer, text, |id| {
            if let Some(piece) = stream.push(&tokenizer, id)? {
                print!("{piece}");
                io::stdout().flush()?;
            }
            Ok(())
        });
        match outcome {
            Ok(result) => {
                if let Some(rest) = stream.finish(&tokenizer)? {
                    print!("{rest}");
                }
                println!();
                println!(
                    "[{} tokens, first token {:.0} ms, {:.2} tok/s]",
                    result.generated_tokens.len(),
                    result.first_token_latency.as_secs_f64() * 1000.0,
                    result.tokens_per_second()
                );
            }
            Err(e) => {
                println!();
                eprintln!("error: {e}");
                if session.is_corrupted() {
                    eprintln!("the session state is undefined; type `reset` to continue");
                }
            }
        }
    }
    Ok(())
}

/// `--tokenizer`, or the first known vocabulary file in the model directory.
fn resolve_tokenizer(explicit: Option<&Path>, model_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    for name in TOKENIZER_CANDIDATES {
        let path = model_dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }
    bail!(
        "no tokenizer found in {}; pass --tokenizer",
        model_dir.display()
    )
}
