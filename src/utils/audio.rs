use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Unknown,
}

impl AudioFormat {
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            AudioFormat::Wav
        } else if bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
            AudioFormat::Mp3
        } else {
            AudioFormat::Unknown
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Unknown => "bin",
        }
    }
}

pub struct WavInfo {
    pub fmt_content: Vec<u8>,
    pub data_offset: u64,
    pub data_size: u32,
}

impl WavInfo {
    /// Playback length derived from the byte rate in the fmt chunk.
    pub fn duration(&self) -> Option<Duration> {
        let byte_rate = u32::from_le_bytes(self.fmt_content.get(8..12)?.try_into().ok()?);
        if byte_rate == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(self.data_size as f64 / byte_rate as f64))
    }
}

pub fn scan_wav<R: Read + Seek>(f: &mut R) -> Result<WavInfo> {
    let mut id = [0u8; 4];
    f.read_exact(&mut id)?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip file size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id)?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt_content: Option<Vec<u8>> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        if &chunk_id == b"fmt " {
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf)?;
            fmt_content = Some(buf);
        } else if &chunk_id == b"data" {
            return Ok(WavInfo {
                fmt_content: fmt_content.ok_or_else(|| anyhow!("data chunk before fmt chunk"))?,
                data_offset: f.stream_position()?,
                data_size: chunk_size,
            });
        } else {
            f.seek(SeekFrom::Current(chunk_size as i64))?;
        }
    }

    Err(anyhow!("Missing data chunk"))
}

pub fn wav_info(bytes: &[u8]) -> Result<WavInfo> {
    scan_wav(&mut Cursor::new(bytes))
}

/// Resolves once the stop flag turns true. Never resolves if the sender is gone.
pub async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `cmd` to completion unless `stop` fires first, in which case the child is killed.
/// Returns `false` when stopped.
pub async fn run_until_stopped(mut cmd: Command, mut stop: watch::Receiver<bool>) -> Result<bool> {
    let program = format!("{:?}", cmd.as_std().get_program());
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if !status.success() {
                let mut stderr = String::new();
                if let Some(mut err) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = err.read_to_string(&mut stderr).await;
                }
                return Err(anyhow!("{} exited with {}: {}", program, status, stderr.trim()));
            }
            Ok(true)
        }
        _ = wait_for_stop(&mut stop) => {
            debug!("Stopping {}", program);
            let _ = child.kill().await;
            Ok(false)
        }
    }
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Plays encoded audio. Returns early, without error, when `stop` fires.
    async fn play(&self, audio: &[u8], stop: watch::Receiver<bool>) -> Result<()>;
}

/// Hands audio to an external player program through a temporary file.
pub struct CommandPlayer {
    command: Vec<String>,
}

impl CommandPlayer {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AudioPlayer for CommandPlayer {
    async fn play(&self, audio: &[u8], stop: watch::Receiver<bool>) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("No audio player command configured"))?;

        let suffix = format!(".{}", AudioFormat::sniff(audio).extension());
        let file = tempfile::Builder::new().suffix(&suffix).tempfile()?;
        tokio::fs::write(file.path(), audio).await?;

        let mut cmd = Command::new(program);
        cmd.args(args).arg(file.path());
        run_until_stopped(cmd, stop).await?;
        Ok(())
    }
}

#[cfg(feature = "rodio")]
pub struct RodioPlayer;

#[cfg(feature = "rodio")]
#[async_trait]
impl AudioPlayer for RodioPlayer {
    async fn play(&self, audio: &[u8], stop: watch::Receiver<bool>) -> Result<()> {
        let data = audio.to_vec();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let (_stream, handle) = rodio::OutputStream::try_default()?;
            let sink = rodio::Sink::try_new(&handle)?;
            sink.append(rodio::Decoder::new(Cursor::new(data))?);
            while !sink.empty() {
                if *stop.borrow() {
                    sink.stop();
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        })
        .await??;
        Ok(())
    }
}

pub fn default_player(command: Vec<String>) -> std::sync::Arc<dyn AudioPlayer> {
    #[cfg(feature = "rodio")]
    {
        let _ = command;
        std::sync::Arc::new(RodioPlayer)
    }
    #[cfg(not(feature = "rodio"))]
    {
        std::sync::Arc::new(CommandPlayer::new(command))
    }
}

#[cfg(test)]
pub(crate) fn create_dummy_wav(size: u32, sample_rate: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + size).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    buf.extend_from_slice(&2u16.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes());

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&vec![0u8; size as usize]);
    buf
}
