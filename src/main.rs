//! Isotropic spectrum reconstruction CLI
//!
//! Generate synthetic MAS training data, train the ConvLSTM ensemble and
//! reconstruct isotropic spectra from measured MAS series.
#![recursion_limit = "256"]

use clap::{Parser, Subcommand};
use isonet::{Config, Result};

#[derive(Parser)]
#[command(name = "isonet")]
#[command(about = "Isotropic NMR spectra from MAS series using deep learning", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project with default config
    Init,
    /// Train the ensemble on synthetic data
    Train {
        /// Override number of epochs
        #[arg(long)]
        epochs: Option<usize>,
        /// Override output directory
        #[arg(long)]
        out_dir: Option<String>,
        /// Compute backend (cpu or wgpu)
        #[arg(long, default_value = "cpu")]
        backend: BackendKind,
        /// Continue from checkpoint in the output directory
        #[arg(long)]
        resume: bool,
    },
    /// Draw synthetic samples and write them as JSON
    Sample {
        /// Number of samples
        #[arg(short, long, default_value = "1")]
        count: usize,
        /// RNG seed
        #[arg(long)]
        seed: Option<u64>,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Reconstruct an isotropic spectrum from measured MAS spectra
    Predict {
        /// Training output directory holding the model
        model_dir: String,
        /// Input JSON with `rates`, `real` and optional `imag`
        input: String,
        /// Largest input value after scaling
        #[arg(long, default_value = "0.5")]
        xmax: f32,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Show configuration and checkpoint information
    Info {
        /// Training output directory (defaults to the configured one)
        dir: Option<String>,
    },
}

#[derive(Clone, Copy, Debug)]
enum BackendKind {
    Cpu,
    Wgpu,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" | "ndarray" => Ok(BackendKind::Cpu),
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            _ => Err(format!("Unknown backend: {}. Use cpu or wgpu.", s)),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load or create config
    let config = if std::path::Path::new(&cli.config).exists() {
        match Config::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Run command
    let result = match cli.command {
        Commands::Init => commands::init(&cli.config),
        Commands::Train {
            epochs,
            out_dir,
            backend,
            resume,
        } => commands::train(&config, epochs, out_dir, backend, resume),
        Commands::Sample {
            count,
            seed,
            output,
        } => commands::sample(&config, count, seed, output),
        Commands::Predict {
            model_dir,
            input,
            xmax,
            output,
        } => commands::predict(&model_dir, &input, xmax, output),
        Commands::Info { dir } => commands::info(&config, dir),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

mod commands {
    use super::*;
    use burn::backend::{Autodiff, NdArray, Wgpu};
    use burn::tensor::backend::AutodiffBackend;
    use isonet::data::SampleGenerator;
    use isonet::predict::Predictor;
    use isonet::training::{CheckpointDir, Trainer, TrainingState};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    pub fn init(config_path: &str) -> Result<()> {
        let config = Config::default();
        config.save(config_path)?;
        println!("Created default config at {}", config_path);

        println!("\nNext steps:");
        println!("  1. Edit {} to customize settings", config_path);
        println!("  2. Run 'isonet sample' to inspect generated data");
        println!("  3. Run 'isonet train' to train the ensemble");
        println!("  4. Run 'isonet predict <model_dir> <input.json>' to reconstruct spectra");

        Ok(())
    }

    pub fn train(
        config: &Config,
        epochs: Option<usize>,
        out_dir: Option<String>,
        backend: BackendKind,
        resume: bool,
    ) -> Result<()> {
        let mut config = config.clone();
        if let Some(e) = epochs {
            config.train.n_epochs = e;
        }
        if let Some(dir) = out_dir {
            config.train.out_dir = dir;
        }
        config.validate()?;

        println!("Initializing training ({:?} backend)...", backend);
        match backend {
            BackendKind::Cpu => run_training::<Autodiff<NdArray<f32>>>(config, Default::default(), resume),
            BackendKind::Wgpu => run_training::<Autodiff<Wgpu<f32, i32>>>(config, Default::default(), resume),
        }
    }

    fn run_training<B: AutodiffBackend>(config: Config, device: B::Device, resume: bool) -> Result<()> {
        let out_dir = config.train.out_dir.clone();
        let mut trainer = Trainer::<B>::new(config, device)?;
        if resume {
            trainer = trainer.resume()?;
        }

        let (_, history) = trainer.train()?;

        println!("\nTraining complete!");
        if let (Some(loss), Some(epoch)) = (history.best_val_loss, history.best_epoch) {
            println!("  Best validation loss: {:.4e} (epoch {})", loss, epoch + 1);
        }
        println!("  Model saved to {}", out_dir);
        Ok(())
    }

    #[derive(Serialize)]
    struct SampleRecord {
        rates: Vec<f64>,
        nw: usize,
        channels: usize,
        td: usize,
        input: Vec<f32>,
        target: Vec<f32>,
    }

    pub fn sample(config: &Config, count: usize, seed: Option<u64>, output: Option<String>) -> Result<()> {
        let generator = SampleGenerator::symmetric(config.data.clone())?;
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        let records = generator
            .iter(rng)
            .take(count)
            .map(|s| {
                s.map(|s| SampleRecord {
                    rates: s.rates,
                    nw: s.nw,
                    channels: s.channels,
                    td: s.td,
                    input: s.input,
                    target: s.target,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        write_output(&records, output.as_deref())?;
        log::info!("Generated {} sample(s)", records.len());
        Ok(())
    }

    #[derive(Deserialize)]
    struct MeasuredSeries {
        rates: Vec<f64>,
        real: Vec<Vec<f32>>,
        #[serde(default)]
        imag: Option<Vec<Vec<f32>>>,
    }

    pub fn predict(model_dir: &str, input: &str, xmax: f32, output: Option<String>) -> Result<()> {
        type MyBackend = NdArray<f32>;

        let series: MeasuredSeries = isonet::read_json(Path::new(input))?;
        let predictor = Predictor::<MyBackend>::load(Path::new(model_dir), Default::default())?;
        let reconstruction = predictor.predict(&series.real, series.imag.as_deref(), &series.rates, xmax)?;

        write_output(&reconstruction, output.as_deref())
    }

    pub fn info(config: &Config, dir: Option<String>) -> Result<()> {
        let dir = dir.unwrap_or_else(|| config.train.out_dir.clone());
        let ckpt = CheckpointDir::new(&dir);

        println!("Configuration");
        println!("───────────────────────────────");
        println!("  Points (td):     {}", config.data.iso_pars.td);
        println!("  MAS spectra:     {}", config.data.mas_pars.nw);
        println!("  Channels:        {}", config.data.channels());
        println!("  Ensemble size:   {}", config.model.n_models);
        println!("  Hidden dims:     {:?}", config.model.hidden_dim);
        println!("  Epochs:          {}", config.train.n_epochs);
        match config.validate() {
            Ok(()) => println!("  Status:          valid"),
            Err(e) => println!("  Status:          {}", e),
        }

        println!("\nCheckpoint ({})", dir);
        println!("───────────────────────────────");
        if !ckpt.has_checkpoint() {
            println!("  No checkpoint found");
            return Ok(());
        }
        let state = TrainingState::load(&ckpt.state())?;
        println!("  Epochs done:     {}", state.epoch);
        println!("  Learning rate:   {:.3e}", state.scheduler.lr());
        if let (Some(loss), Some(epoch)) = (state.history.best_val_loss, state.history.best_epoch) {
            println!("  Best val loss:   {:.4e} (epoch {})", loss, epoch + 1);
        }
        println!("  Loss fuzz:       {}", state.loss_pars.trg_fuzz);

        Ok(())
    }

    fn write_output<T: Serialize>(value: &T, output: Option<&str>) -> Result<()> {
        match output {
            Some(path) => {
                isonet::write_json(Path::new(path), value)?;
                println!("Wrote {}", path);
            }
            None => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }
}
