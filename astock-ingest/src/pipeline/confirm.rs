//! Operator confirmation for destructive or irreversible steps.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Asks the operator a yes/no question.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Fixed answer, for non-interactive runs (`--yes`) and tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        info!(prompt, answer = self.0, "Auto-confirmed");
        self.0
    }
}

/// Line-based y/n prompt over any reader/writer pair.
///
/// Invalid answers re-ask; end of input counts as "no".
pub struct PromptConfirm<R, W> {
    io: Mutex<(R, W)>,
}

/// Interactive prompt on the process terminal.
pub type StdinConfirm = PromptConfirm<BufReader<Stdin>, Stdout>;

impl StdinConfirm {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> PromptConfirm<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
        }
    }

    pub fn into_inner(self) -> (R, W) {
        self.io.into_inner()
    }
}

fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl<R, W> Confirm for PromptConfirm<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&self, prompt: &str) -> bool {
        let mut guard = self.io.lock().await;
        let (reader, writer) = &mut *guard;

        loop {
            let question = format!("{} (y/n): ", prompt);
            if writer.write_all(question.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                warn!("Cannot write confirmation prompt, treating as no");
                return false;
            }

            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => return false,
                Ok(_) => {
                    if let Some(answer) = parse_answer(&line) {
                        return answer;
                    }
                    let _ = writer.write_all(b"Please answer y or n.\n").await;
                }
                Err(e) => {
                    warn!(error = %e, "Cannot read confirmation answer, treating as no");
                    return false;
                }
            }
        }
    }
}
