use anyhow::{bail, Context, Result};
use asrlink_audio::{AudioSource, FileSource};
use asrlink_client::{RecognitionClient, RecognitionStream, ScriptedTransport};
use asrlink_core::{AppConfig, RecognitionEvent};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "asrlink", about = "Streaming speech recognition client")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recognize a recorded audio file
    File {
        path: PathBuf,

        /// Send the file as one chunk instead of streaming it
        #[arg(long)]
        whole: bool,

        /// Print only the last final transcript
        #[arg(long)]
        text_only: bool,
    },
    /// Recognize live microphone audio; press Enter to stop
    #[cfg(feature = "capture")]
    Live {
        #[arg(short, long, default_value = "default")]
        device: String,

        /// Stop by itself after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,
    },
    /// List audio input devices
    #[cfg(feature = "capture")]
    Devices,
}

fn build_client(config: &AppConfig) -> Result<RecognitionClient> {
    let Some(script) = &config.transport.script else {
        bail!("no transport configured: set [transport] script to a replay file");
    };
    let transport = ScriptedTransport::load_from_file(script)
        .with_context(|| format!("failed to load replay script from {script:?}"))?;
    tracing::info!(
        script = %script.display(),
        steps = transport.steps().len(),
        "using replay transport"
    );
    Ok(RecognitionClient::from_app_config(Arc::new(transport), config))
}

/// Print events as they arrive. Returns the final utterances once the
/// stream ends; a failure event becomes the error.
async fn print_events(mut stream: RecognitionStream) -> Result<Vec<String>> {
    let mut finals = Vec::new();
    loop {
        let event = tokio::select! {
            event = stream.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                let state = stream.cancel().await;
                tracing::info!(?state, "interrupted");
                return Ok(finals);
            }
        };
        match event {
            Some(RecognitionEvent::Transcript { text, is_final }) => {
                if is_final {
                    println!("{text}");
                    finals.push(text);
                } else {
                    println!("~ {text}");
                }
            }
            Some(RecognitionEvent::BackendInfo {
                model_name,
                model_version,
            }) => tracing::info!(%model_name, %model_version, "backend"),
            Some(RecognitionEvent::Insight { payload }) => println!("# {payload}"),
            Some(RecognitionEvent::VoiceActivity { has_voice }) => {
                tracing::debug!(has_voice, "voice activity")
            }
            Some(RecognitionEvent::Failure { cause, .. }) => {
                return Err(cause).context("recognition failed");
            }
            None => return Ok(finals),
        }
    }
}

async fn run_file(config: &AppConfig, path: PathBuf, whole: bool, text_only: bool) -> Result<()> {
    let client = build_client(config)?;
    let source: Box<dyn AudioSource> = if whole {
        Box::new(FileSource::whole(&path))
    } else {
        Box::new(FileSource::new(&path))
    };
    let timeout = client.options().timeout;

    if text_only {
        let text = client
            .recognize_to_text(source, config.recognition.clone(), timeout)
            .await
            .with_context(|| format!("failed to recognize {path:?}"))?;
        println!("{text}");
        return Ok(());
    }

    let stream = client.start_streaming_recognition(source, config.recognition.clone(), timeout)?;
    print_events(stream).await.map(|_| ())
}

#[cfg(feature = "capture")]
async fn run_live(config: &AppConfig, device: String, seconds: Option<u64>) -> Result<()> {
    use std::time::Duration;

    let client = build_client(config)?;
    let mut source = asrlink_audio::CaptureSource::new(
        &device,
        config.recognition.sample_rate_hz,
        config.recognition.channel_count,
    );
    if let Some(seconds) = seconds {
        source = source.with_max_duration(Duration::from_secs(seconds));
    }
    let timeout = client.options().timeout;
    let stream = client.start_streaming_recognition(
        Box::new(source),
        config.recognition.clone(),
        timeout,
    )?;

    let stop = stream.stop_handle();
    on_enter(std::io::BufReader::new(std::io::stdin()), move || stop.stop())
        .context("failed to spawn stdin listener")?;
    eprintln!("listening on '{device}'; press Enter to stop");

    let finals = print_events(stream).await?;
    if let Some(summary) = summary(&finals) {
        println!("\n{summary}");
    }
    Ok(())
}

/// Run `f` once a line arrives on `input`. The reader lives on a detached
/// thread, so a session that ends by itself never waits for Enter.
#[cfg_attr(not(feature = "capture"), allow(dead_code))]
fn on_enter<R, F>(mut input: R, f: F) -> std::io::Result<()>
where
    R: std::io::BufRead + Send + 'static,
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name("stdin-stop".to_string())
        .spawn(move || {
            let mut line = String::new();
            if matches!(input.read_line(&mut line), Ok(n) if n > 0) {
                f();
            }
        })
        .map(|_| ())
}

/// Every final utterance of a session, joined into one line.
#[cfg_attr(not(feature = "capture"), allow(dead_code))]
fn summary(finals: &[String]) -> Option<String> {
    let parts: Vec<&str> = finals
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    (!parts.is_empty()).then(|| parts.join(" "))
}

#[cfg(feature = "capture")]
fn list_devices() -> Result<()> {
    let devices = asrlink_audio::DeviceManager::new()
        .input_device_names()
        .context("failed to enumerate input devices")?;
    for (name, is_default) in devices {
        let marker = if is_default { " (default)" } else { "" };
        println!("{name}{marker}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from_file(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    let env_filter = EnvFilter::try_new(&config.general.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    tracing::info!(endpoint = %config.endpoint(), "asrlink starting");

    match cli.command {
        Command::File {
            path,
            whole,
            text_only,
        } => run_file(&config, path, whole, text_only).await,
        #[cfg(feature = "capture")]
        Command::Live { device, seconds } => run_live(&config, device, seconds).await,
        #[cfg(feature = "capture")]
        Command::Devices => list_devices(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Read};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    /// A reader that blocks until its sender is dropped.
    struct Silent(mpsc::Receiver<()>);

    impl Read for Silent {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn test_summary_joins_finals() {
        let finals = vec!["привет".to_string(), " ".to_string(), "мир ".to_string()];
        assert_eq!(summary(&finals).as_deref(), Some("привет мир"));
        assert_eq!(summary(&[]), None);
    }

    #[test]
    fn test_on_enter_fires_on_line() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        on_enter(std::io::Cursor::new(b"\n".to_vec()), move || {
            flag.store(true, Ordering::SeqCst)
        })
        .unwrap();
        let start = Instant::now();
        while !fired.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5), "never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_blocked_listener_does_not_hold_runtime() {
        let (_keep_open, rx) = mpsc::channel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            on_enter(BufReader::new(Silent(rx)), move || {
                flag.store(true, Ordering::SeqCst)
            })
            .unwrap();
        });
        let start = Instant::now();
        drop(runtime);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
