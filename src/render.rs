//! Turning accumulated message source into its display form.
//!
//! Renderers are pure functions of the whole source text. The reconciler
//! always re-renders from the full buffer, because the meaning of earlier
//! text can change once more tokens arrive (an opening code fence, for
//! example, swallows everything after it until the closing one shows up).

/// Converts message source into what the pane displays.
pub trait Renderer: Send + Sync {
    fn render(&self, source: &str) -> String;
}

/// Shows the source verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, source: &str) -> String {
        source.to_string()
    }
}

/// Keeps partially streamed markdown well formed by closing a code fence
/// that has been opened but not yet closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceBalancingRenderer;

impl FenceBalancingRenderer {
    /// Number of fence delimiter lines (```` ``` ```` or `~~~`) in `source`.
    pub fn fence_count(source: &str) -> usize {
        source.lines().filter_map(fence_delimiter).count()
    }

    /// Delimiter of the fence still open at the end of `source`.
    pub fn open_fence(source: &str) -> Option<&str> {
        let mut open: Option<&str> = None;
        for delim in source.lines().filter_map(fence_delimiter) {
            match open {
                None => open = Some(delim),
                // A fence closes only on the same character, at least as long.
                Some(o) if delim.as_bytes()[0] == o.as_bytes()[0] && delim.len() >= o.len() => open = None,
                Some(_) => {}
            }
        }
        open
    }
}

/// The run of backticks or tildes that makes `line` a fence delimiter.
fn fence_delimiter(line: &str) -> Option<&str> {
    let t = line.trim_start_matches(' ');
    if line.len() - t.len() > 3 {
        return None;
    }
    let ch = t.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let run = t.len() - t.trim_start_matches(ch).len();
    (run >= 3).then(|| &t[..run])
}

impl Renderer for FenceBalancingRenderer {
    fn render(&self, source: &str) -> String {
        let Some(delim) = Self::open_fence(source) else {
            return source.to_string();
        };
        let mut out = String::with_capacity(source.len() + delim.len() + 1);
        out.push_str(source);
        if !source.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(delim);
        out
    }
}
