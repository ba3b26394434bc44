//! Normalization and rewriting of commands typed into the browser terminal.

use std::sync::OnceLock;

use regex::Regex;

/// Collapse pasted multi-line input into one logical command line.
///
/// Backslash line continuations are joined and runs of whitespace,
/// including bare line breaks, collapse to a single space.
pub fn normalize(raw: &str) -> String {
    static CONTINUATION: OnceLock<Option<Regex>> = OnceLock::new();
    let continuation = CONTINUATION.get_or_init(|| Regex::new(r"\\[ \t]*\r?\n\s*").ok());

    let joined = match continuation {
        Some(re) => re.replace_all(raw, " ").into_owned(),
        None => raw.to_string(),
    };

    joined.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a normalized command is the built-in `clear`.
pub fn is_clear(command: &str) -> bool {
    command.eq_ignore_ascii_case("clear")
}

/// A remote-fetch tool whose output is made quieter before it runs.
struct FetchRewrite {
    tool: &'static str,
    detect: fn(&[&str]) -> bool,
    rewrite: fn(&[&str]) -> String,
}

const FETCH_REWRITES: &[FetchRewrite] = &[
    FetchRewrite {
        tool: "curl",
        detect: detect_curl,
        rewrite: rewrite_curl,
    },
    FetchRewrite {
        tool: "wget",
        detect: detect_wget,
        rewrite: rewrite_wget,
    },
    FetchRewrite {
        tool: "httpie",
        detect: detect_httpie,
        rewrite: keep_words,
    },
];

/// Whether a command fetches something over HTTP.
pub fn is_remote_fetch(command: &str) -> bool {
    let words = split_words(command);
    FETCH_REWRITES.iter().any(|entry| (entry.detect)(&words)) || contains_url(command)
}

/// Rewrite a normalized command so known HTTP clients skip progress output.
///
/// Commands that are not recognised are returned unchanged.
pub fn rewrite_remote_fetch(command: &str) -> String {
    let words = split_words(command);
    for entry in FETCH_REWRITES {
        if (entry.detect)(&words) {
            let rewritten = (entry.rewrite)(&words);
            if rewritten != command {
                tracing::debug!(tool = entry.tool, original = command, rewritten = %rewritten, "Rewrote fetch command");
            }
            return rewritten;
        }
    }
    command.to_string()
}

fn invokes(words: &[&str], tool: &str) -> bool {
    words.len() > 1 && words[0].eq_ignore_ascii_case(tool)
}

fn detect_curl(words: &[&str]) -> bool {
    invokes(words, "curl")
}

fn detect_wget(words: &[&str]) -> bool {
    invokes(words, "wget")
}

fn detect_httpie(words: &[&str]) -> bool {
    ["http", "https", "httpie"]
        .iter()
        .any(|tool| invokes(words, tool))
}

/// HTTPie prints no meter; the command is sent as is.
fn keep_words(words: &[&str]) -> String {
    words.join(" ")
}

fn contains_url(command: &str) -> bool {
    let lower = command.to_ascii_lowercase();
    lower.contains("http://") || lower.contains("https://")
}

const CURL_QUIET_FLAGS: &[&str] = &["-s", "-S", "-sS", "-Ss", "--silent", "--show-error"];

/// `curl ...` becomes `curl -sS ...`: no meter, errors still shown.
fn rewrite_curl(words: &[&str]) -> String {
    let mut out = vec!["curl", "-sS"];
    out.extend(
        words[1..]
            .iter()
            .copied()
            .filter(|word| !CURL_QUIET_FLAGS.contains(word)),
    );
    out.join(" ")
}

/// `wget ...` gains `-q` unless it is already quiet.
fn rewrite_wget(words: &[&str]) -> String {
    let already_quiet = words[1..].iter().any(|word| {
        *word == "--quiet" || (word.starts_with('-') && !word.starts_with("--") && word.contains('q'))
    });
    if already_quiet {
        return words.join(" ");
    }
    let mut out = vec!["wget", "-q"];
    out.extend_from_slice(&words[1..]);
    out.join(" ")
}

/// Split on spaces that are outside quotes.
///
/// Quoted words are returned whole, quotes included, so rejoining with a
/// single space reproduces a normalized command.
fn split_words(command: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start: Option<usize> = None;

    for (idx, c) in command.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (_, '\\') if quote != Some('\'') => {
                escaped = true;
                start.get_or_insert(idx);
            }
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => {
                quote = Some(c);
                start.get_or_insert(idx);
            }
            (None, c) if c.is_whitespace() => {
                if let Some(begin) = start.take() {
                    words.push(&command[begin..idx]);
                }
            }
            (None, _) => {
                start.get_or_insert(idx);
            }
        }
    }
    if let Some(begin) = start {
        words.push(&command[begin..]);
    }
    words
}
