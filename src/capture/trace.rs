//! Thread and call-stack attribution.
//!
//! Capturing a call stack is comparatively expensive, so it happens exactly
//! once per connection, at open time. Packets only carry the (cheap) thread
//! identity of the I/O call that produced them.

use std::backtrace::Backtrace;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Default upper bound on a rendered call stack, in bytes.
pub const MAX_STACK_TRACE_LEN: usize = 16 * 1024;

/// Frames from these paths are dropped from the top of a captured stack.
const INTERNAL_FRAME_PREFIXES: &[&str] = &[
    "std::backtrace",
    "std::backtrace_rs",
    "wiretap::",
    "<wiretap::",
];

/// Identity of a thread.
///
/// Equality and hashing use the thread id only.
#[derive(Debug, Clone)]
pub struct ThreadMetadata {
    id: ThreadId,
    name: Option<Arc<str>>,
}

impl ThreadMetadata {
    /// Metadata for the calling thread.
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            id: current.id(),
            name: current.name().map(Arc::from),
        }
    }

    /// Thread id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name, if the thread was named.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this is the calling thread.
    pub fn is_current(&self) -> bool {
        self.id == thread::current().id()
    }
}

impl PartialEq for ThreadMetadata {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadMetadata {}

impl Hash for ThreadMetadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ThreadMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({:?})", name, self.id),
            None => write!(f, "{:?}", self.id),
        }
    }
}

/// Rendered call stack of the code that opened a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallStack(Arc<str>);

impl CallStack {
    /// Build from rendered backtrace text, trimming internal frames and
    /// truncating to `max_len` bytes.
    pub fn from_rendered(rendered: &str, max_len: usize) -> Self {
        let trimmed = trim_internal_frames(rendered);
        Self(Arc::from(truncate(&trimmed, max_len)))
    }

    /// Rendered text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Symbol name of each frame, outermost last.
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.0.lines().filter_map(frame_symbol)
    }
}

impl fmt::Display for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Thread and (optionally) call stack captured when a connection opens.
#[derive(Debug, Clone)]
pub struct TraceContext {
    /// Opening thread.
    pub thread: ThreadMetadata,
    /// Opening call stack, when stack capture is enabled.
    pub stack: Option<CallStack>,
}

/// Captures attribution context for new connections.
#[derive(Debug, Clone)]
pub struct TraceAttributor {
    capture_stack_traces: bool,
    max_stack_len: usize,
}

impl TraceAttributor {
    /// Create an attributor.
    pub fn new(capture_stack_traces: bool) -> Self {
        Self {
            capture_stack_traces,
            max_stack_len: MAX_STACK_TRACE_LEN,
        }
    }

    /// Set the maximum rendered stack length.
    pub fn with_max_stack_len(mut self, max_stack_len: usize) -> Self {
        self.max_stack_len = max_stack_len;
        self
    }

    /// Whether call stacks are captured.
    pub fn captures_stack_traces(&self) -> bool {
        self.capture_stack_traces
    }

    /// Capture the calling thread and, if enabled, its call stack.
    pub fn capture_context(&self) -> TraceContext {
        let stack = self.capture_stack_traces.then(|| {
            let backtrace = Backtrace::force_capture();
            CallStack::from_rendered(&backtrace.to_string(), self.max_stack_len)
        });

        TraceContext {
            thread: ThreadMetadata::current(),
            stack,
        }
    }
}

impl Default for TraceAttributor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Symbol of a frame header line such as `  12: my_crate::module::function`.
fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.trim_start().split_once(": ")?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(symbol.trim())
}

/// Drop leading frames that belong to the capture machinery itself.
fn trim_internal_frames(rendered: &str) -> String {
    let mut skipping = true;
    let mut out = String::with_capacity(rendered.len());

    for line in rendered.lines() {
        if let Some(symbol) = frame_symbol(line) {
            if skipping
                && !INTERNAL_FRAME_PREFIXES
                    .iter()
                    .any(|prefix| symbol.starts_with(prefix))
            {
                skipping = false;
            }
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }

    // Nothing but internal frames: keep the original
    if out.is_empty() {
        rendered.to_string()
    } else {
        out
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [truncated]");
    truncated
}
