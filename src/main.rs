use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kopivoice::audio::wav;
use kopivoice::{
    BackendChoice, Config, ModelSize, SessionController, SessionEvent, config, understand,
};

/// Kopivoice - real-time speech transcription gateway
#[derive(Parser)]
#[command(name = "kopivoice", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream microphone audio through a transcription backend
    Live {
        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Transcribe a WAV file
    Transcribe {
        /// Path to the audio file
        file: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,
    },
    /// Analyze an audio file with a free-form prompt
    Analyze {
        /// Path to the audio file
        file: PathBuf,

        /// Analysis prompt
        #[arg(short, long, default_value = "Describe this audio clip")]
        prompt: String,
    },
    /// Record the microphone to a WAV file
    Record {
        /// Output path
        #[arg(default_value = "recording.wav")]
        file: PathBuf,

        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// List audio input devices
    Devices,
}

/// Backend selection shared by the live and transcribe commands
#[derive(clap::Args)]
struct BackendArgs {
    /// Transcription backend
    #[arg(long, value_enum, default_value_t = BackendKind::Cloud)]
    backend: BackendKind,

    /// Local model size (with --backend local)
    #[arg(long, value_enum, default_value_t = ModelSize::Turbo)]
    model: ModelSize,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum BackendKind {
    /// On-device Whisper inference, no network
    Local,
    /// Groq Whisper HTTP API
    Cloud,
    /// Gemini Live full-duplex session with audio responses
    Live,
}

impl BackendArgs {
    fn choice(&self) -> BackendChoice {
        match self.backend {
            BackendKind::Local => BackendChoice::LocalModel(self.model),
            BackendKind::Cloud => BackendChoice::CloudStt,
            BackendKind::Live => BackendChoice::LiveMultimodal,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,kopivoice=info",
        1 => "info,kopivoice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    config::load_dotenv();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Live { backend } => run_live(backend.choice()).await,
        Command::Transcribe { file, backend } => {
            let config = Config::for_backend(backend.choice());
            let text = understand::transcribe_file(&file, &config).await?;
            println!("{text}");
            Ok(())
        }
        Command::Analyze { file, prompt } => {
            let api_keys = kopivoice::ApiKeys::from_env();
            let text = understand::analyze_file(&file, &prompt, &api_keys).await?;
            println!("{text}");
            Ok(())
        }
        Command::Record { file, duration } => {
            wav::record_to_file(&file, Duration::from_secs(duration)).await?;
            println!("saved {}", file.display());
            Ok(())
        }
        Command::Devices => {
            for name in wav::list_input_devices()? {
                println!("{name}");
            }
            Ok(())
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run_live(choice: BackendChoice) -> anyhow::Result<()> {
    let config = Config::for_backend(choice);
    let (controller, mut events) = SessionController::new(config)?;
    let cancel = controller.cancellation();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping session");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged(state) => {
                    tracing::info!(state = %state, "session");
                }
                SessionEvent::Partial(fragment) => {
                    // Carriage return keeps interim text on one line
                    print!("\r… {}", fragment.text);
                    use std::io::Write;
                    let _ = std::io::stdout().flush();
                }
                SessionEvent::Final(fragment) => {
                    println!("\r{}", fragment.text);
                }
            }
        }
    });

    let result = controller.run().await;
    printer.abort();
    result.map_err(Into::into)
}
