use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::{AudioMode, EncodeSettings};
use crate::error::TranscodeError;
use crate::oracle::{TranscodeOutput, Transcoder};

/// Lines of ffmpeg stderr kept in error messages
const STDERR_TAIL_LINES: usize = 20;

/// Builds the ffmpeg argument list for the H.264 re-encode
#[derive(Debug, Clone)]
pub struct EncodeCommand {
    settings: EncodeSettings,
}

impl EncodeCommand {
    pub fn new(settings: EncodeSettings) -> Self {
        Self { settings }
    }

    /// Generates:
    /// - quiet, non-interactive ffmpeg (several run side by side)
    /// - video re-encode with CRF, preset and pixel format normalisation
    /// - audio copy or fixed-bitrate AAC
    /// - fast-start flag and forced overwrite of the output
    pub fn build(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-i".into(),
            input.as_os_str().to_os_string(),
            "-c:v".into(),
            s.video_codec.as_str().into(),
            "-crf".into(),
            s.crf.to_string().into(),
            "-preset".into(),
            s.preset.as_str().into(),
            "-pix_fmt".into(),
            s.pixel_format.as_str().into(),
        ];

        match &s.audio {
            AudioMode::Copy => {
                args.push("-c:a".into());
                args.push("copy".into());
            }
            AudioMode::Aac { bitrate_kbps } => {
                args.push("-c:a".into());
                args.push("aac".into());
                args.push("-b:a".into());
                args.push(format!("{}k", bitrate_kbps).into());
            }
        }

        if s.faststart {
            args.push("-movflags".into());
            args.push("+faststart".into());
        }

        args.push("-y".into());
        args.push(output.as_os_str().to_os_string());
        args
    }
}

/// Runs ffmpeg as a child process
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg_bin: PathBuf,
    command: EncodeCommand,
}

impl FfmpegTool {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, settings: EncodeSettings) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            command: EncodeCommand::new(settings),
        }
    }

    /// Execute ffmpeg with `args`, killing it once `limit` elapses
    pub async fn execute<S: AsRef<OsStr>>(&self, args: &[S], limit: Duration) -> Result<TranscodeOutput, TranscodeError> {
        debug!("Executing FFmpeg: {} {}", self.ffmpeg_bin.display(), join_lossy(args));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TranscodeError::Spawn)?;

        let stderr = child.stderr.take().ok_or_else(|| {
            TranscodeError::Spawn(std::io::Error::new(std::io::ErrorKind::Other, "failed to capture ffmpeg stderr"))
        })?;

        // Drain stderr to EOF so a chatty ffmpeg never blocks on a full pipe
        // or dies on a closed one; non-UTF-8 bytes are replaced, not fatal
        let stderr_handle = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
                    }
                    Err(e) => {
                        warn!("Failed to read ffmpeg stderr: {}", e);
                        break;
                    }
                }
            }
            lines
        });

        let status = match tokio::time::timeout(limit, child.wait()).await {
            Ok(result) => result.map_err(TranscodeError::Spawn)?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out ffmpeg: {}", e);
                }
                return Err(TranscodeError::TimedOut { secs: limit.as_secs() });
            }
        };

        let lines = stderr_handle.await.unwrap_or_default();
        let stderr = tail(&lines, STDERR_TAIL_LINES);

        if !status.success() {
            return Err(TranscodeError::Failed {
                exit_code: status.code(),
                stderr,
            });
        }

        Ok(TranscodeOutput { stderr })
    }
}

#[async_trait]
impl Transcoder for FfmpegTool {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<TranscodeOutput, TranscodeError> {
        let args = self.command.build(input, output);
        self.execute(&args, timeout).await
    }
}

fn join_lossy<S: AsRef<OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| a.as_ref().to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_template() {
        let cmd = EncodeCommand::new(EncodeSettings::default());
        let args = cmd.build(Path::new("/s/_PROCESSING/A001.mov"), Path::new("/s/A001.mov"));
        let joined = join_lossy(&args);
        assert_eq!(
            joined,
            "-hide_banner -nostdin -i /s/_PROCESSING/A001.mov -c:v libx264 -crf 23 -preset medium \
             -pix_fmt yuv420p -c:a copy -movflags +faststart -y /s/A001.mov"
        );
    }

    #[test]
    fn test_aac_audio_and_no_faststart() {
        let settings = EncodeSettings {
            audio: AudioMode::Aac { bitrate_kbps: 256 },
            faststart: false,
            ..Default::default()
        };
        let args = EncodeCommand::new(settings).build(Path::new("in.mov"), Path::new("out.mov"));
        let pos = args.iter().position(|a| a == "-b:a").unwrap();
        assert_eq!(args[pos + 1], "256k");
        assert!(args.iter().any(|a| a == "aac"));
        assert!(!args.iter().any(|a| a == "-movflags"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_paths_pass_through_unchanged() {
        use std::os::unix::ffi::OsStrExt;

        let input = Path::new(OsStr::from_bytes(b"/s/_PROCESSING/clip\xff.mov"));
        let output = Path::new(OsStr::from_bytes(b"/s/clip\xff.mov"));
        let args = EncodeCommand::new(EncodeSettings::default()).build(input, output);

        let pos = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[pos + 1].as_os_str(), input.as_os_str());
        assert_eq!(args.last().map(OsString::as_os_str), Some(output.as_os_str()));
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let lines: Vec<String> = (0..30).map(|i| format!("line {}", i)).collect();
        let t = tail(&lines, 3);
        assert_eq!(t, "line 27\nline 28\nline 29");
        assert_eq!(tail(&lines[..2], 5), "line 0\nline 1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_timeout_kills_process() {
        // `sleep` stands in for a hung encoder
        let tool = FfmpegTool::new("sleep", EncodeSettings::default());
        let result = tool.execute(&["5".to_string()], Duration::from_millis(200)).await;
        assert!(matches!(result, Err(TranscodeError::TimedOut { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let tool = FfmpegTool::new("sh", EncodeSettings::default());
        let args = vec!["-c".to_string(), "echo 'Device or resource busy' >&2; exit 3".to_string()];
        match tool.execute(&args, Duration::from_secs(5)).await {
            Err(TranscodeError::Failed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("resource busy"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_is_drained_past_invalid_utf8() {
        let tool = FfmpegTool::new("sh", EncodeSettings::default());
        let script = "printf 'bad \\377\\376 bytes\\n' >&2; echo 'last line' >&2; exit 4";
        match tool.execute(&["-c", script], Duration::from_secs(5)).await {
            Err(TranscodeError::Failed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(4));
                assert!(stderr.contains("bad "), "{}", stderr);
                assert!(stderr.ends_with("last line"), "{}", stderr);
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let tool = FfmpegTool::new("/nonexistent/ffmpeg", EncodeSettings::default());
        let result = tool.execute::<&str>(&[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TranscodeError::Spawn(_))));
    }

    proptest! {
        #[test]
        fn test_output_is_always_last(crf in 0u8..52, preset in prop_oneof![Just("fast"), Just("medium"), Just("slow")]) {
            let settings = EncodeSettings { crf, preset: preset.to_string(), ..Default::default() };
            let args = EncodeCommand::new(settings).build(Path::new("in.mov"), Path::new("out.mov"));
            prop_assert_eq!(args.last().map(OsString::as_os_str), Some(OsStr::new("out.mov")));
            prop_assert_eq!(&args[args.len() - 2], "-y");
            let crf_pos = args.iter().position(|a| a == "-crf").unwrap();
            let crf_str = crf.to_string();
            prop_assert_eq!(args[crf_pos + 1].to_str(), Some(crf_str.as_str()));
        }
    }
}
