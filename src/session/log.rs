//! Append-only terminal log of a session.

/// Ordered fragments of everything written to a session's terminal since it
/// was created or last cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLog {
    fragments: Vec<String>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append shell output. Empty text adds nothing.
    pub fn push_output(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.fragments.push(text);
        }
    }

    /// Append the prompt-prefixed echo of a command.
    ///
    /// The echo always starts on its own line and ends with a line break so
    /// the command's output starts below it.
    pub fn push_command_echo(&mut self, command: &str) {
        let needs_break = self
            .fragments
            .last()
            .is_some_and(|last| !last.is_empty() && !last.ends_with('\n'));
        let prefix = if needs_break { "\n" } else { "" };
        self.fragments.push(format!("{}$ {}\n", prefix, command));
    }

    /// Append a bracketed notice such as `[Shell session ended]`.
    pub fn push_notice(&mut self, notice: &str) {
        self.fragments.push(format!("\n[{}]\n", notice));
    }

    /// Mark the start of a terminal with an empty fragment, if nothing was written yet.
    pub fn mark_started(&mut self) {
        if self.fragments.is_empty() {
            self.fragments.push(String::new());
        }
    }

    /// Reset to a single empty fragment.
    pub fn clear(&mut self) {
        self.fragments = vec![String::new()];
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.fragments.clone()
    }

    /// All fragments concatenated.
    pub fn joined(&self) -> String {
        self.fragments.concat()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
