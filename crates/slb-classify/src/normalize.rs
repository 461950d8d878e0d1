//! Command normalization ahead of pattern matching.
//!
//! Normalization never executes or expands anything. It splits a command line
//! on top-level separators, strips wrapper programs, and rewrites path-like
//! arguments into a lexically cleaned absolute form, so that
//! `sudo rm -rf /tmp/../../etc` is matched as `rm -rf /etc`.

use std::path::{Component, Path, PathBuf};

/// Programs that run another command and are stripped before matching.
const WRAPPERS: &[&str] = &[
    "sudo", "doas", "env", "command", "builtin", "time", "nice", "ionice", "nohup", "strace",
    "ltrace",
];

/// Programs whose `a/b` arguments name resources, refs or packages rather
/// than files (`deployment/web`, `origin/main`, `@scope/pkg`). Their
/// arguments are kept as written.
const NON_PATH_PROGRAMS: &[&str] = &[
    "kubectl", "helm", "oc", "docker", "podman", "git", "terraform", "aws", "gcloud", "az",
    "npm", "yarn", "pnpm", "pip", "pip3", "cargo", "brew", "apt", "apt-get", "psql", "mysql",
    "redis-cli", "mongo", "mongosh",
];

/// A command reduced to the form the rule table is written against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedCommand {
    /// One entry per top-level command, tokens joined by single spaces,
    /// path arguments resolved.
    pub segments: Vec<String>,
    /// Wrapper programs removed from the front of segments, in order.
    pub stripped_wrappers: Vec<String>,
    /// Some segment had unbalanced quotes and was split on whitespace instead.
    pub parse_error: bool,
}

impl NormalizedCommand {
    pub fn joined(&self) -> String {
        self.segments.join(" ; ")
    }
}

/// Normalize `command` as if it were run from `cwd`.
pub fn normalize(command: &str, cwd: &Path) -> NormalizedCommand {
    let mut out = NormalizedCommand::default();

    for raw in split_compound(command) {
        let tokens = match tokenize(&raw) {
            Some(tokens) => tokens,
            None => {
                out.parse_error = true;
                raw.split_whitespace().map(str::to_string).collect()
            }
        };

        let (rest, wrappers) = strip_wrappers(&tokens);
        out.stripped_wrappers.extend(wrappers);

        let Some((program, args)) = rest.split_first() else {
            continue;
        };

        let program = command_name(program);
        let takes_paths = !NON_PATH_PROGRAMS.contains(&program);
        let mut words = Vec::with_capacity(rest.len());
        words.push(program.to_string());
        for arg in args {
            if takes_paths {
                words.push(resolve_token(arg, cwd));
            } else {
                words.push(arg.clone());
            }
        }
        out.segments.push(words.join(" "));
    }

    out
}

// ── Splitting ──────────────────────────────────────────────────

/// Split on `;`, newlines, `&&`, `||` and a backgrounding `&`, ignoring
/// anything inside quotes. Pipes stay inside their segment.
pub fn split_compound(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut chars = command.chars().peekable();

    let mut flush = |current: &mut String| {
        let seg = current.trim();
        if !seg.is_empty() {
            segments.push(seg.to_string());
        }
        current.clear();
    };

    while let Some(c) = chars.next() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match quote {
            Some(q) => {
                if c == '\\' && q == '"' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                current.push(c);
            }
            None => match c {
                '\\' => {
                    escaped = true;
                    current.push(c);
                }
                '\'' | '"' => {
                    quote = Some(c);
                    current.push(c);
                }
                ';' | '\n' => flush(&mut current),
                '&' if chars.peek() == Some(&'&') => {
                    chars.next();
                    flush(&mut current);
                }
                '|' if chars.peek() == Some(&'|') => {
                    chars.next();
                    flush(&mut current);
                }
                // `2>&1`, `>&2`, `&>file` and `|&` are redirections, not separators.
                '&' if current.ends_with(['>', '<', '|']) || chars.peek() == Some(&'>') => {
                    current.push(c);
                }
                '&' => flush(&mut current),
                _ => current.push(c),
            },
        }
    }
    flush(&mut current);

    segments
}

/// Split one segment into words with POSIX-style quoting.
///
/// Returns `None` when a quote is left open.
pub fn tokenize(segment: &str) -> Option<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some('\'') => {
                if c == '\'' {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            Some(_) => match c {
                '"' => quote = None,
                '\\' => match chars.peek() {
                    Some(&n) if matches!(n, '"' | '\\' | '$' | '`') => {
                        current.push(n);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                _ => current.push(c),
            },
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                '\\' => {
                    if let Some(n) = chars.next() {
                        current.push(n);
                    }
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_token {
        tokens.push(current);
    }
    Some(tokens)
}

// ── Wrappers ───────────────────────────────────────────────────

/// Options of each wrapper that consume the following word.
fn options_with_argument(wrapper: &str) -> &'static [&'static str] {
    match wrapper {
        "sudo" => &["-u", "-g", "-C", "-D", "-p", "-r", "-t", "-U", "-T"],
        "doas" => &["-u", "-C"],
        "env" => &["-u", "-C", "-S", "--unset", "--chdir", "--split-string"],
        "time" => &["-o", "-f", "--output", "--format"],
        "nice" => &["-n", "--adjustment"],
        "ionice" => &["-c", "-n", "-p", "-P", "-u", "--class", "--classdata"],
        "strace" | "ltrace" => &["-o", "-e", "-p", "-s", "-u", "-E", "-a", "-P", "-I", "-X", "-b", "-O"],
        _ => &[],
    }
}

fn is_env_assignment(token: &str) -> bool {
    let Some((name, _)) = token.split_once('=') else {
        return false;
    };
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Remove leading `VAR=value` assignments and wrapper programs (with their
/// options) until the real program is at the front.
pub fn strip_wrappers(tokens: &[String]) -> (&[String], Vec<String>) {
    let mut stripped = Vec::new();
    let mut i = 0;

    loop {
        while tokens.get(i).is_some_and(|t| is_env_assignment(t)) {
            i += 1;
        }
        let Some(token) = tokens.get(i) else {
            break;
        };
        let name = command_name(token);
        if !WRAPPERS.contains(&name) {
            break;
        }
        // `command -v rm` only looks a program up.
        if name == "command"
            && tokens
                .get(i + 1)
                .is_some_and(|t| t == "-v" || t == "-V")
        {
            break;
        }

        stripped.push(name.to_string());
        i += 1;

        let takes_arg = options_with_argument(name);
        while let Some(opt) = tokens.get(i) {
            if opt == "--" {
                i += 1;
                break;
            }
            if !opt.starts_with('-') {
                break;
            }
            i += 1;
            if takes_arg.contains(&opt.as_str()) {
                i += 1;
            }
        }
    }

    (tokens.get(i..).unwrap_or(&[]), stripped)
}

/// Program name without its directory: `/usr/bin/sudo` → `sudo`.
pub fn command_name(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

// ── Paths ──────────────────────────────────────────────────────

fn looks_like_path(token: &str) -> bool {
    if token.is_empty() || token.contains("://") || token.starts_with(['~', '$']) {
        return false;
    }
    token.contains('/') || token == "." || token == ".."
}

fn resolve_path_like(token: &str, cwd: &Path) -> String {
    if !looks_like_path(token) {
        return token.to_string();
    }
    let joined = if token.starts_with('/') {
        PathBuf::from(token)
    } else {
        cwd.join(token)
    };
    clean_path(&joined).display().to_string()
}

/// A quoted word is a path only if it is shaped like one: absolute,
/// `./` or `../` relative, or holding a `..` component.
fn quoted_path(token: &str) -> bool {
    token.starts_with('/')
        || token.starts_with("./")
        || token.starts_with("../")
        || token.contains("/../")
        || token.ends_with("/..")
}

/// Resolve one argument. `--flag=value` and `key=value` resolve their value.
/// Words with whitespace came from quotes and are resolved only when shaped
/// like a path.
pub fn resolve_token(token: &str, cwd: &Path) -> String {
    let quoted = token.chars().any(char::is_whitespace);
    let resolve = |value: &str| {
        if quoted && !quoted_path(value) {
            value.to_string()
        } else {
            resolve_path_like(value, cwd)
        }
    };
    if token.starts_with('-') {
        return match token.split_once('=') {
            Some((flag, value)) => format!("{}={}", flag, resolve(value)),
            None => token.to_string(),
        };
    }
    match token.split_once('=') {
        Some((key, value))
            if !key.is_empty() && !key.contains('/') && !key.contains(char::is_whitespace) =>
        {
            format!("{}={}", key, resolve(value))
        }
        _ => resolve(token),
    }
}

/// Lexically clean a path: drop `.`, fold `..` into its parent. `..` at the
/// root stays at the root. No filesystem access, symlinks are not followed.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
