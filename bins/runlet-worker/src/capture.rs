// Per-invocation capture of engine output

/// Receiver for discrete engine events, one call per event.
pub trait Sink {
    fn emit(&mut self, entry: String);
}

/// Records every emitted entry, in emission order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CaptureChannel {
    entries: Vec<String>,
}

impl CaptureChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<String> {
        self.entries
    }

    /// All entries on separate lines.
    pub fn joined(&self) -> String {
        self.entries.join("\n")
    }
}

impl Sink for CaptureChannel {
    fn emit(&mut self, entry: String) {
        self.entries.push(entry);
    }
}
