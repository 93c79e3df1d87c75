//! Assistant demo — full turn loop with best-available engines.
//!
//! - **STT**: WhisperStt (with the `whisper` feature and `WHISPER_MODEL_PATH`),
//!   else RemoteStt (`STT_API_KEY`), else a placeholder.
//! - **LLM**: RemoteLlm (`LLM_API_KEY`), else a placeholder echo.
//! - **TTS**: RemoteTts (`TTS_API_KEY`), else silent placeholder.
//!
//! Set keys in `.env` to hear real replies. Press Ctrl+C to stop.

use sotto_voice::{
    create_best_stt, Assistant, AssistantConfig, EngineSet, LlmBackend, PlaceholderLlm,
    PlaceholderTts, RemoteLlm, RemoteTts, RodioPlayback, TtsBackend,
};
use sotto_web::DuckDuckGoClient;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Sotto demo — speak, pause, get an answer. Ctrl+C to stop.");

    let stt = create_best_stt()?;
    let llm: Arc<dyn LlmBackend> = match RemoteLlm::from_env() {
        Ok(remote) => {
            info!("LLM: remote chat completions ({})", remote.model);
            Arc::new(remote)
        }
        Err(_) => {
            info!("LLM: placeholder echo (set LLM_API_KEY for real replies)");
            Arc::new(PlaceholderLlm::new())
        }
    };
    let tts: Arc<dyn TtsBackend> = match RemoteTts::from_env() {
        Ok(remote) => {
            info!("TTS: remote synthesis (voice {})", remote.voice);
            Arc::new(remote)
        }
        Err(_) => {
            info!("TTS: placeholder silence (set TTS_API_KEY to hear replies)");
            Arc::new(PlaceholderTts)
        }
    };

    let engines = EngineSet {
        stt: Arc::from(stt),
        llm,
        tts,
        playback: Arc::new(RodioPlayback::new()?),
        search: Arc::new(DuckDuckGoClient::new()?),
    };

    let mut assistant = Assistant::new(AssistantConfig::default(), engines)?;
    assistant.start().await?;

    tokio::signal::ctrl_c().await?;
    assistant.stop().await;
    Ok(())
}
