use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use log::{debug, info};

const TESSERACT_BIN: &str = "tesseract";

/// Text recognition backed by the system `tesseract` binary.
///
/// Absence of the binary is not an error: `detect` returns None once at
/// startup and chat watching degrades to the remaining rule sources.
#[derive(Debug, Clone)]
pub struct OcrEngine {
    program: String,
}

impl OcrEngine {
    pub fn detect() -> Option<Self> {
        let probe = Command::new(TESSERACT_BIN)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match probe {
            Ok(status) if status.success() => {
                info!("ocr backend available ({TESSERACT_BIN})");
                Some(Self {
                    program: TESSERACT_BIN.to_string(),
                })
            }
            Ok(status) => {
                debug!("{TESSERACT_BIN} probe exited with {status}");
                None
            }
            Err(err) => {
                debug!("{TESSERACT_BIN} not found: {err}");
                None
            }
        }
    }

    /// Runs recognition over PNG bytes and returns the raw text.
    pub fn extract_text(&self, png_bytes: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(["-", "stdout"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn tesseract")?;

        {
            let mut stdin = child.stdin.take().context("tesseract stdin unavailable")?;
            stdin
                .write_all(png_bytes)
                .context("failed to stream image to tesseract")?;
        }

        let output = child
            .wait_with_output()
            .context("failed to collect tesseract output")?;
        if !output.status.success() {
            bail!("tesseract exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
