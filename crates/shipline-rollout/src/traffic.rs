//! Traffic-shift command templates.
//!
//! An operator supplies a command such as
//! `deployctl shift --version {target_version} --percent {to_rollout_percent}`.
//! The template is split into an argument vector first, using POSIX
//! shell-word rules, and placeholders are then filled in per word. A
//! substituted value always stays inside the word it was written in: it is
//! never re-split, unquoted, or otherwise interpreted.
//!
//! Brace syntax inside a word: `{name}` is a placeholder, `{{` and `}}` are
//! literal braces. Attribute, index, conversion, and format-spec syntax is
//! rejected.

use std::collections::BTreeSet;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use wait_timeout::ChildExt;

/// Every placeholder a template may use.
pub const PLACEHOLDERS: [&str; 16] = [
    "action",
    "target_version",
    "from_version",
    "to_version",
    "correlation_id",
    "release_candidate_id",
    "from_rollout_percent",
    "to_rollout_percent",
    "canary_rollout_percent",
    "stable_rollout_percent",
    "canary_version",
    "stable_version",
    "before_canary_rollout_percent",
    "before_stable_rollout_percent",
    "before_canary_version",
    "before_stable_version",
];

/// Captured output is cut to this many trailing characters.
pub const MAX_CAPTURE_CHARS: usize = 4000;

/// Lower bound on the command timeout.
pub const MIN_TIMEOUT_S: f64 = 0.1;

/// Upper bound on the command timeout.
pub const MAX_TIMEOUT_S: f64 = 86_400.0;

/// Default command timeout.
pub const DEFAULT_TIMEOUT_S: f64 = 30.0;

/// How long output readers get once the command has been killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("single '}}' encountered in word {word}")]
    UnmatchedClose { word: usize },

    #[error("expected '}}' before end of word {word}")]
    Unclosed { word: usize },

    #[error("empty placeholder '{{}}' in word {word}")]
    EmptyField { word: usize },

    #[error("unsupported placeholder syntax '{{{0}}}'")]
    UnsupportedField(String),

    #[error("unknown placeholder '{0}'")]
    UnknownPlaceholder(String),

    #[error("no closing quotation ({0})")]
    UnclosedQuote(char),

    #[error("no escaped character after trailing backslash")]
    TrailingBackslash,
}

impl TemplateError {
    /// True for errors raised while splitting words, as opposed to
    /// placeholder syntax.
    pub fn is_word_error(&self) -> bool {
        matches!(self, TemplateError::UnclosedQuote(_) | TemplateError::TrailingBackslash)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed command template: one segment list per argv word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    words: Vec<Vec<Segment>>,
}

impl CommandTemplate {
    pub fn parse(text: &str) -> Result<Self, TemplateError> {
        let words = split_words(text)?
            .iter()
            .enumerate()
            .map(|(i, word)| parse_word(word, i + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { words })
    }

    /// Distinct placeholder names, sorted.
    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.words
            .iter()
            .flatten()
            .filter_map(|seg| match seg {
                Segment::Field(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Fill in every placeholder from `ctx`.
    pub fn render(&self, ctx: &TemplateContext) -> Result<Vec<String>, TemplateError> {
        self.words
            .iter()
            .map(|word| {
                let mut out = String::new();
                for seg in word {
                    match seg {
                        Segment::Literal(text) => out.push_str(text),
                        Segment::Field(name) => out.push_str(
                            ctx.get(name)
                                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.clone()))?,
                        ),
                    }
                }
                Ok(out)
            })
            .collect()
    }
}

/// Split `text` into words: whitespace separates, single quotes are
/// literal, double quotes honour `\"` and `\\`, and a backslash outside
/// quotes escapes the next character.
fn split_words(text: &str) -> Result<Vec<String>, TemplateError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(TemplateError::UnclosedQuote('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch @ ('"' | '\\')) => current.push(ch),
                            Some(ch) => {
                                current.push('\\');
                                current.push(ch);
                            }
                            None => return Err(TemplateError::UnclosedQuote('"')),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(TemplateError::UnclosedQuote('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(ch) => current.push(ch),
                    None => return Err(TemplateError::TrailingBackslash),
                }
            }
            ch => {
                in_word = true;
                current.push(ch);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn parse_word(word: &str, index: usize) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = word.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err(TemplateError::Unclosed { word: index }),
                    }
                }
                let name = field.trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyField { word: index });
                }
                if name.contains(['.', '[', ']', '!', ':', '{']) {
                    return Err(TemplateError::UnsupportedField(name.to_string()));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Field(name.to_string()));
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => return Err(TemplateError::UnmatchedClose { word: index }),
            ch => literal.push(ch),
        }
    }
    if !literal.is_empty() || segments.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

// ── Validation ──────────────────────────────────────────────────────

/// Static check of a template, reported as-is in rollout reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateValidation {
    pub ok: bool,
    pub placeholders: Vec<String>,
    pub unknown_placeholders: Vec<String>,
    pub parse_error: String,
    pub supported_placeholders: Vec<String>,
}

/// Validate `text`. An empty template is valid.
pub fn validate_template(text: &str) -> TemplateValidation {
    let supported: BTreeSet<&str> = PLACEHOLDERS.iter().copied().collect();
    let supported_placeholders = supported.iter().map(|s| s.to_string()).collect();
    let text = text.trim();
    if text.is_empty() {
        return TemplateValidation {
            ok: true,
            placeholders: Vec::new(),
            unknown_placeholders: Vec::new(),
            parse_error: String::new(),
            supported_placeholders,
        };
    }
    match CommandTemplate::parse(text) {
        Ok(template) => {
            let placeholders: Vec<String> =
                template.placeholders().into_iter().map(str::to_string).collect();
            let unknown_placeholders: Vec<String> = placeholders
                .iter()
                .filter(|name| !supported.contains(name.as_str()))
                .cloned()
                .collect();
            TemplateValidation {
                ok: unknown_placeholders.is_empty(),
                placeholders,
                unknown_placeholders,
                parse_error: String::new(),
                supported_placeholders,
            }
        }
        Err(err) => TemplateValidation {
            ok: false,
            placeholders: Vec::new(),
            unknown_placeholders: Vec::new(),
            parse_error: err.to_string(),
            supported_placeholders,
        },
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// Values available to a template. Percentages are pre-rendered as
/// decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateContext {
    pub action: String,
    pub target_version: String,
    pub from_version: String,
    pub to_version: String,
    pub correlation_id: String,
    pub release_candidate_id: String,
    pub from_rollout_percent: String,
    pub to_rollout_percent: String,
    pub canary_rollout_percent: String,
    pub stable_rollout_percent: String,
    pub canary_version: String,
    pub stable_version: String,
    pub before_canary_rollout_percent: String,
    pub before_stable_rollout_percent: String,
    pub before_canary_version: String,
    pub before_stable_version: String,
}

impl TemplateContext {
    pub fn get(&self, name: &str) -> Option<&str> {
        let value = match name {
            "action" => &self.action,
            "target_version" => &self.target_version,
            "from_version" => &self.from_version,
            "to_version" => &self.to_version,
            "correlation_id" => &self.correlation_id,
            "release_candidate_id" => &self.release_candidate_id,
            "from_rollout_percent" => &self.from_rollout_percent,
            "to_rollout_percent" => &self.to_rollout_percent,
            "canary_rollout_percent" => &self.canary_rollout_percent,
            "stable_rollout_percent" => &self.stable_rollout_percent,
            "canary_version" => &self.canary_version,
            "stable_version" => &self.stable_version,
            "before_canary_rollout_percent" => &self.before_canary_rollout_percent,
            "before_stable_rollout_percent" => &self.before_stable_rollout_percent,
            "before_canary_version" => &self.before_canary_version,
            "before_stable_version" => &self.before_stable_version,
            _ => return None,
        };
        Some(value.as_str())
    }
}

// ── Execution ───────────────────────────────────────────────────────

/// Result of running (or declining to run) the traffic command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficOutcome {
    pub executed: bool,
    pub ok: bool,
    pub reason: String,
    pub command_template: String,
    pub command_rendered: String,
    pub command_argv: Vec<String>,
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TrafficOutcome {
    /// Nothing was run. `ok` decides whether that counts as success.
    pub fn not_run(reason: impl Into<String>, ok: bool, template: &str) -> Self {
        Self {
            executed: false,
            ok,
            reason: reason.into(),
            command_template: template.to_string(),
            command_rendered: String::new(),
            command_argv: Vec::new(),
            return_code: if ok { 0 } else { -1 },
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Render `template` against `ctx` and run it, waiting at most
/// `timeout_s` seconds (see [`timeout_duration`]).
pub fn run_traffic_command(template: &str, ctx: &TemplateContext, timeout_s: f64) -> TrafficOutcome {
    let raw = template.trim();
    if raw.is_empty() {
        return TrafficOutcome::not_run("empty_command", false, "");
    }
    let argv = match CommandTemplate::parse(raw).and_then(|t| t.render(ctx)) {
        Ok(argv) => argv,
        Err(err) if err.is_word_error() => {
            return TrafficOutcome::not_run(format!("argv_parse_error:{err}"), false, raw);
        }
        Err(err) => {
            return TrafficOutcome::not_run(format!("template_render_error:{err}"), false, raw);
        }
    };
    if argv.is_empty() {
        return TrafficOutcome::not_run("empty_argv_after_render", false, raw);
    }

    let mut outcome = TrafficOutcome::not_run("", false, raw);
    outcome.command_rendered = shell_join(&argv);
    outcome.command_argv = argv.clone();
    outcome.executed = true;

    match execute(&argv, timeout_duration(timeout_s)) {
        Ok(run) => {
            outcome.stdout = tail(&run.stdout, MAX_CAPTURE_CHARS);
            outcome.stderr = tail(&run.stderr, MAX_CAPTURE_CHARS);
            match run.code {
                None => {
                    outcome.reason = "timeout".into();
                }
                Some(code) => {
                    outcome.return_code = code;
                    outcome.ok = code == 0;
                    outcome.reason = if code == 0 {
                        "ok".into()
                    } else {
                        format!("non_zero_exit:{code}")
                    };
                }
            }
        }
        Err(err) => {
            outcome.reason = format!("exec_error:{err}");
        }
    }

    if outcome.ok {
        info!(command = %outcome.command_rendered, "traffic command succeeded");
    } else {
        warn!(command = %outcome.command_rendered, reason = %outcome.reason, "traffic command failed");
    }
    outcome
}

struct Finished {
    /// `None` on timeout.
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

/// `timeout_s` clamped to [`MIN_TIMEOUT_S`]..=[`MAX_TIMEOUT_S`]. NaN
/// becomes the minimum.
pub fn timeout_duration(timeout_s: f64) -> Duration {
    let secs = timeout_s.max(MIN_TIMEOUT_S).min(MAX_TIMEOUT_S);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs_f64(MIN_TIMEOUT_S))
}

/// Run `argv` in its own process group. The whole group is killed on
/// timeout, and so is any descendant still holding the output pipes once
/// the deadline has passed.
fn execute(argv: &[String], timeout: Duration) -> std::io::Result<Finished> {
    let deadline = Instant::now() + timeout;
    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let mut child = command.spawn()?;

    // Drain both pipes while waiting so a chatty child cannot block.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match child.wait_timeout(timeout) {
        Ok(status) => status,
        Err(e) => {
            terminate(&mut child);
            return Err(e);
        }
    };
    let drain_until = match status {
        Some(_) => deadline.max(Instant::now() + Duration::from_millis(50)),
        None => {
            terminate(&mut child);
            Instant::now() + DRAIN_GRACE
        }
    };

    let stdout = collect(stdout, drain_until);
    let stderr = collect(stderr, drain_until);
    let mut code = status.map(|s| s.code().unwrap_or(-1));
    if code.is_some() && (stdout.is_none() || stderr.is_none()) {
        warn!(
            pid = child.id(),
            "command exited but its output pipes stayed open past the deadline"
        );
        kill_group(child.id());
        code = None;
    }

    Ok(Finished {
        // `None` when killed: no exit code.
        code,
        stdout: stdout.unwrap_or_default(),
        stderr: stderr.unwrap_or_default(),
    })
}

fn terminate(child: &mut Child) {
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: `killpg` only sends a signal; the group was created for
    // this child by `process_group(0)`.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Read `pipe` to EOF on a detached thread and hand the bytes over.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Output of a reader, or `None` if it did not finish by `until`. A late
/// reader is left to finish on its own.
fn collect(reader: Option<Receiver<Vec<u8>>>, until: Instant) -> Option<String> {
    let Some(rx) = reader else {
        return Some(String::new());
    };
    let wait = until.saturating_duration_since(Instant::now());
    rx.recv_timeout(wait)
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// The last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Quote `argv` for display the way a POSIX shell would accept it.
fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|word| {
            let safe = !word.is_empty()
                && word
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./_-".contains(c));
            if safe {
                word.clone()
            } else {
                format!("'{}'", word.replace('\'', r#"'"'"'"#))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext {
            action: "set_canary".into(),
            target_version: "1.2.0".into(),
            to_rollout_percent: "5".into(),
            correlation_id: "corr; rm -rf /".into(),
            ..Default::default()
        }
    }

    #[test]
    fn splits_before_substituting() {
        let t = CommandTemplate::parse("deploy --id {correlation_id} --pct={to_rollout_percent}%").unwrap();
        let argv = t.render(&ctx()).unwrap();
        assert_eq!(argv, vec!["deploy", "--id", "corr; rm -rf /", "--pct=5%"]);
    }

    #[test]
    fn quotes_and_escapes() {
        let words = split_words(r#"a 'b c' "d \"e\" \x" f\ g ''"#).unwrap();
        assert_eq!(words, vec!["a", "b c", r#"d "e" \x"#, "f g", ""]);
        assert_eq!(split_words("a 'b"), Err(TemplateError::UnclosedQuote('\'')));
        assert_eq!(split_words("a \\"), Err(TemplateError::TrailingBackslash));
    }

    #[test]
    fn brace_grammar() {
        let t = CommandTemplate::parse("echo {{literal}} {action}").unwrap();
        assert_eq!(t.render(&ctx()).unwrap(), vec!["echo", "{literal}", "set_canary"]);

        assert!(matches!(CommandTemplate::parse("echo }"), Err(TemplateError::UnmatchedClose { .. })));
        assert!(matches!(CommandTemplate::parse("echo {action"), Err(TemplateError::Unclosed { .. })));
        assert!(matches!(CommandTemplate::parse("echo {}"), Err(TemplateError::EmptyField { .. })));
        for bad in ["{a.b}", "{a[0]}", "{a!r}", "{a:>5}"] {
            assert!(matches!(
                CommandTemplate::parse(bad),
                Err(TemplateError::UnsupportedField(_))
            ));
        }
    }

    #[test]
    fn validation_reports_unknown_names() {
        let v = validate_template("run {target_version} {bogus} {action} {action}");
        assert!(!v.ok);
        assert_eq!(v.placeholders, vec!["action", "bogus", "target_version"]);
        assert_eq!(v.unknown_placeholders, vec!["bogus"]);
        assert_eq!(v.supported_placeholders.len(), 16);
        assert_eq!(v.supported_placeholders[0], "action");
    }

    #[test]
    fn validation_of_empty_and_broken_templates() {
        assert!(validate_template("   ").ok);
        let v = validate_template("run {target_version");
        assert!(!v.ok);
        assert!(!v.parse_error.is_empty());
    }

    #[test]
    fn every_placeholder_resolves() {
        let ctx = TemplateContext::default();
        for name in PLACEHOLDERS {
            assert!(ctx.get(name).is_some(), "{name}");
        }
        assert!(ctx.get("nope").is_none());
    }

    #[test]
    fn unknown_placeholder_is_render_error() {
        let out = run_traffic_command("echo {nope}", &ctx(), 1.0);
        assert!(!out.executed);
        assert!(out.reason.starts_with("template_render_error:"));
        let out = run_traffic_command("echo 'open", &ctx(), 1.0);
        assert!(out.reason.starts_with("argv_parse_error:"));
        let out = run_traffic_command("  ", &ctx(), 1.0);
        assert_eq!(out.reason, "empty_command");
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("ééé", 2), "éé");
    }

    #[test]
    fn shell_join_quotes_unsafe_words() {
        let argv = vec!["echo".to_string(), "a b".into(), "it's".into(), String::new()];
        assert_eq!(shell_join(&argv), r#"echo 'a b' 'it'"'"'s' ''"#);
    }

    #[cfg(unix)]
    #[test]
    fn runs_and_captures_output() {
        let out = run_traffic_command("echo {target_version}", &ctx(), 5.0);
        assert!(out.ok, "{out:?}");
        assert_eq!(out.reason, "ok");
        assert_eq!(out.return_code, 0);
        assert_eq!(out.stdout, "1.2.0\n");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_and_timeout() {
        let out = run_traffic_command("sh -c 'exit 3'", &ctx(), 5.0);
        assert!(out.executed && !out.ok);
        assert_eq!(out.reason, "non_zero_exit:3");
        assert_eq!(out.return_code, 3);

        let out = run_traffic_command("sleep 5", &ctx(), 0.2);
        assert!(!out.ok);
        assert_eq!(out.reason, "timeout");
        assert_eq!(out.return_code, -1);
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_the_whole_pipeline() {
        let started = Instant::now();
        let out = run_traffic_command("sh -c 'sleep 4 | cat; true'", &TemplateContext::default(), 0.2);
        let elapsed = started.elapsed();
        assert_eq!(out.reason, "timeout");
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[cfg(unix)]
    #[test]
    fn background_child_holding_pipes_does_not_outlive_timeout() {
        let started = Instant::now();
        let out = run_traffic_command("sh -c 'sleep 4 & exit 0'", &TemplateContext::default(), 0.3);
        let elapsed = started.elapsed();
        assert!(!out.ok);
        assert_eq!(out.reason, "timeout");
        assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");
    }

    #[test]
    fn out_of_range_timeouts_are_clamped() {
        assert_eq!(timeout_duration(f64::INFINITY), Duration::from_secs(86_400));
        assert_eq!(timeout_duration(1e300), Duration::from_secs(86_400));
        assert_eq!(timeout_duration(f64::NAN), Duration::from_millis(100));
        assert_eq!(timeout_duration(-3.0), Duration::from_millis(100));
        assert_eq!(timeout_duration(2.5), Duration::from_millis(2500));
    }

    #[cfg(unix)]
    #[test]
    fn infinite_timeout_still_runs() {
        let out = run_traffic_command("true", &ctx(), f64::INFINITY);
        assert!(out.ok, "{}", out.reason);
        let out = run_traffic_command("true", &ctx(), f64::NAN);
        assert!(out.ok, "{}", out.reason);
    }

    #[test]
    fn spawn_failure_is_exec_error() {
        let out = run_traffic_command("/definitely/not/a/binary", &ctx(), 1.0);
        assert!(out.executed && !out.ok);
        assert!(out.reason.starts_with("exec_error:"));
    }
}
