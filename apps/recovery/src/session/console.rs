use async_trait::async_trait;
use crossterm::style::Stylize;
use std::future;
use std::io::{self, Write};
use std::thread;
use tokio::sync::oneshot;
use tracing::warn;

/// Operator-facing side of the recovery session.
#[async_trait]
pub trait OperatorConsole: Send + Sync {
    fn banner(&self, title: &str, body: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn spacer(&self);
    fn scannable(&self, code: &str);
    /// Resolves once the operator enters anything at the prompt.
    async fn wait_for_abort(&self) -> io::Result<()>;
}

/// Prints to stdout and reads the abort keystroke from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalConsole;

impl TerminalConsole {
    fn emit(&self, text: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }
}

#[async_trait]
impl OperatorConsole for TerminalConsole {
    fn banner(&self, title: &str, body: &str) {
        self.emit(&render_box(title, body));
    }

    fn info(&self, message: &str) {
        self.emit(&format!("{} {message}\n", " INFO ".black().on_cyan()));
    }

    fn warn(&self, message: &str) {
        self.emit(&format!("{} {message}\n", " WARNING ".black().on_yellow()));
    }

    fn spacer(&self) {
        self.emit("\n\n");
    }

    fn scannable(&self, code: &str) {
        self.emit(code);
        if !code.ends_with('\n') {
            self.emit("\n");
        }
    }

    async fn wait_for_abort(&self) -> io::Result<()> {
        let read = read_detached(|| {
            let mut line = String::new();
            io::stdin().read_line(&mut line)
        })
        .await?;
        if read == 0 {
            // No operator attached; only an external abort can end the session.
            warn!("console input closed; waiting for external abort");
            future::pending::<()>().await;
        }
        Ok(())
    }
}

/// Runs a blocking console read on its own detached thread. Dropping the
/// returned future abandons the read without holding up runtime shutdown.
pub(crate) async fn read_detached<F>(read: F) -> io::Result<usize>
where
    F: FnOnce() -> io::Result<usize> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("recovery-console".into())
        .spawn(move || {
            let _ = tx.send(read());
        })?;
    rx.await
        .map_err(|_| io::Error::other("console reader exited without a result"))?
}

/// Frames `body` in a box with `title` on the top border.
pub fn render_box(title: &str, body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let inner = lines
        .iter()
        .map(|line| line.chars().count())
        .chain(std::iter::once(title.chars().count() + 2))
        .max()
        .unwrap_or(0);

    let mut out = String::new();
    let title_part = format!(" {title} ");
    out.push('┌');
    out.push_str(&title_part);
    out.push_str(&"─".repeat(inner + 2 - title_part.chars().count()));
    out.push_str("┐\n");
    for line in &lines {
        let pad = inner - line.chars().count();
        out.push_str("│ ");
        out.push_str(line);
        out.push_str(&" ".repeat(pad));
        out.push_str(" │\n");
    }
    out.push('└');
    out.push_str(&"─".repeat(inner + 2));
    out.push_str("┘\n");
    out
}
