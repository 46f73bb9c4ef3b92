//! Build recipe parser.
//!
//! Parses a Dockerfile-syntax recipe into an ordered list of build
//! instructions. Supports line continuations (`\`), comments, quoted
//! values, and both shell and JSON (exec) forms for CMD/ENTRYPOINT/RUN.

use std::fmt;
use std::path::Path;

use stratum_core::error::{Result, StratumError};

use super::executor::shell_quote;

/// A single recipe instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `COPY [--chown=<user>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        chown: Option<String>,
    },
    /// `RUN <command>`
    Run { command: String },
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env { vars: Vec<(String, String)> },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// `LABEL <key>=<value> ...`
    Label { labels: Vec<(String, String)> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: String },
    /// `USER <user>[:<group>]`
    User { user: String },
}

impl Instruction {
    /// Upper-case instruction keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Copy { .. } => "COPY",
            Instruction::Run { .. } => "RUN",
            Instruction::Env { .. } => "ENV",
            Instruction::Arg { .. } => "ARG",
            Instruction::Label { .. } => "LABEL",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::User { .. } => "USER",
        }
    }

    /// Whether the instruction only changes image configuration.
    pub fn is_metadata(&self) -> bool {
        !matches!(
            self,
            Instruction::From { .. }
                | Instruction::Workdir { .. }
                | Instruction::Copy { .. }
                | Instruction::Run { .. }
        )
    }

    /// True for a COPY whose sources include the whole build context.
    pub fn copies_whole_context(&self) -> bool {
        match self {
            Instruction::Copy { src, .. } => src
                .iter()
                .any(|s| matches!(s.trim_end_matches('/'), "." | "" | "./")),
            _ => false,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::From { image, alias } => match alias {
                Some(alias) => write!(f, "FROM {} AS {}", image, alias),
                None => write!(f, "FROM {}", image),
            },
            Instruction::Workdir { path } => write!(f, "WORKDIR {}", path),
            Instruction::Copy { src, dst, chown } => {
                write!(f, "COPY ")?;
                if let Some(chown) = chown {
                    write!(f, "--chown={} ", chown)?;
                }
                write!(f, "{} {}", src.join(" "), dst)
            }
            Instruction::Run { command } => write!(f, "RUN {}", command),
            Instruction::Env { vars } => write!(f, "ENV {}", format_pairs(vars)),
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, "ARG {}={}", name, quote_if_needed(default)),
                None => write!(f, "ARG {}", name),
            },
            Instruction::Label { labels } => write!(f, "LABEL {}", format_pairs(labels)),
            Instruction::Cmd { exec } => write!(f, "CMD {}", format_exec(exec)),
            Instruction::Entrypoint { exec } => write!(f, "ENTRYPOINT {}", format_exec(exec)),
            Instruction::Expose { port } => write!(f, "EXPOSE {}", port),
            Instruction::User { user } => write!(f, "USER {}", user),
        }
    }
}

fn format_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, quote_if_needed(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) || value.contains('"') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn format_exec(exec: &[String]) -> String {
    serde_json::to_string(exec).unwrap_or_else(|_| exec.join(" "))
}

/// Parsed recipe: a list of instructions in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipe {
    pub instructions: Vec<Instruction>,
}

impl Recipe {
    /// Parse a recipe from its text content.
    pub fn parse(content: &str) -> Result<Self> {
        let mut instructions = Vec::new();
        let mut from_seen = false;

        for (line_num, line) in join_continuation_lines(content) {
            let trimmed = line.trim();

            // Skip empty lines and comments
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some(instruction) = parse_instruction(trimmed, line_num)? else {
                continue;
            };

            match &instruction {
                Instruction::From { .. } if from_seen => {
                    return Err(StratumError::recipe(
                        line_num,
                        "multi-stage builds are not supported (second FROM)",
                    ));
                }
                Instruction::From { .. } => from_seen = true,
                Instruction::Arg { .. } => {}
                _ if !from_seen => {
                    return Err(StratumError::recipe(
                        line_num,
                        "first instruction must be FROM (only ARG may precede it)",
                    ));
                }
                _ => {}
            }

            instructions.push(instruction);
        }

        if !from_seen {
            return Err(StratumError::recipe(
                1,
                "recipe is empty or contains no FROM instruction",
            ));
        }

        Ok(Recipe { instructions })
    }

    /// Parse a recipe from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StratumError::Filesystem(format!(
                "Failed to read recipe at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// The canonical layered recipe: base image, working directory,
    /// dependency manifest, dependency install, then the full source tree.
    pub fn layered(base: &str, workdir: &str, manifest: &str, install_command: &str) -> Self {
        Recipe {
            instructions: vec![
                Instruction::From {
                    image: base.to_string(),
                    alias: None,
                },
                Instruction::Workdir {
                    path: workdir.to_string(),
                },
                Instruction::Copy {
                    src: vec![manifest.to_string()],
                    dst: "./".to_string(),
                    chown: None,
                },
                Instruction::Run {
                    command: install_command.to_string(),
                },
                Instruction::Copy {
                    src: vec![".".to_string()],
                    dst: ".".to_string(),
                    chown: None,
                },
            ],
        }
    }

    /// The base image of the recipe.
    pub fn base_image(&self) -> Option<&str> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::From { image, .. } => Some(image.as_str()),
            _ => None,
        })
    }

    /// Flag orderings that defeat layer reuse.
    ///
    /// A RUN placed after a COPY of the entire build context re-executes on
    /// every source change, so dependency installation belongs before it.
    pub fn layering_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut full_copy: Option<usize> = None;

        for (idx, instruction) in self.instructions.iter().enumerate() {
            let step = idx + 1;
            if instruction.copies_whole_context() && full_copy.is_none() {
                full_copy = Some(step);
            }
            if let (Instruction::Run { command }, Some(copy_step)) = (instruction, full_copy) {
                warnings.push(format!(
                    "step {} `RUN {}` follows the full context copy at step {}; \
                     any source change will re-run it. Copy the dependency manifest \
                     and install before copying the source tree",
                    step, command, copy_step
                ));
            }
        }

        warnings
    }
}

/// Join lines ending with `\` into single logical lines.
///
/// Each logical line carries the 1-based number of its first physical line.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start_line = 0;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start_line = idx + 1;
        } else if line.trim_start().starts_with('#') {
            // Comments inside a continuation are dropped
            continue;
        }

        let trimmed_end = line.trim_end();
        if let Some(stripped) = trimmed_end.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start_line, std::mem::take(&mut current)));
        }
    }

    // Handle trailing continuation without final line
    if !current.trim().is_empty() {
        logical_lines.push((start_line, current));
    }

    logical_lines
}

/// Parse a single logical line into an Instruction.
///
/// Returns `None` for recognised but unsupported instructions.
fn parse_instruction(line: &str, line_num: usize) -> Result<Option<Instruction>> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    let instruction = match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num)?,
        "RUN" => parse_run(rest, line_num)?,
        "COPY" => parse_copy(rest, line_num)?,
        "WORKDIR" => parse_workdir(rest, line_num)?,
        "ENV" => parse_env(rest, line_num)?,
        "ENTRYPOINT" => Instruction::Entrypoint {
            exec: parse_exec_form("ENTRYPOINT", rest, line_num)?,
        },
        "CMD" => Instruction::Cmd {
            exec: parse_exec_form("CMD", rest, line_num)?,
        },
        "EXPOSE" => Instruction::Expose {
            port: first_word("EXPOSE", rest, line_num)?,
        },
        "LABEL" => parse_label(rest, line_num)?,
        "USER" => Instruction::User {
            user: first_word("USER", rest, line_num)?,
        },
        "ARG" => parse_arg(rest, line_num)?,
        "ADD" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => {
            tracing::warn!(
                line = line_num,
                instruction = keyword_upper.as_str(),
                "Unsupported recipe instruction, skipping"
            );
            return Ok(None);
        }
        _ => {
            return Err(StratumError::recipe(
                line_num,
                format!("unknown instruction '{}'", keyword),
            ))
        }
    };

    Ok(Some(instruction))
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let words: Vec<&str> = rest.split_whitespace().collect();
    match words.as_slice() {
        [] => Err(StratumError::recipe(line_num, "FROM requires an image argument")),
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, kw, alias] if kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(alias.to_string()),
        }),
        _ => Err(StratumError::recipe(
            line_num,
            format!("invalid FROM arguments '{}'", rest),
        )),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(StratumError::recipe(line_num, "RUN requires a command"));
    }

    // Exec form runs through the shell too, so each element is quoted
    let command = if rest.starts_with('[') {
        let args = parse_json_array(rest, line_num)?;
        if args.is_empty() {
            return Err(StratumError::recipe(line_num, "RUN requires a command"));
        }
        args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ")
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut remaining = rest.trim();
    let mut chown = None;

    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        if let Some(owner) = flag.strip_prefix("--chown=") {
            chown = Some(owner.to_string());
        } else if flag.starts_with("--from=") {
            return Err(StratumError::recipe(
                line_num,
                "COPY --from is not supported (multi-stage builds are not supported)",
            ));
        } else {
            return Err(StratumError::recipe(
                line_num,
                format!("unsupported COPY flag '{}'", flag),
            ));
        }
        remaining = after;
    }

    let mut parts = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        split_words(remaining)
    };

    if parts.len() < 2 {
        return Err(StratumError::recipe(
            line_num,
            "COPY requires at least one source and a destination",
        ));
    }

    let dst = parts.pop().unwrap_or_default();
    Ok(Instruction::Copy {
        src: parts,
        dst,
        chown,
    })
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    let path = unquote(rest);
    if path.is_empty() {
        return Err(StratumError::recipe(line_num, "WORKDIR requires a path"));
    }
    Ok(Instruction::Workdir { path })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(StratumError::recipe(line_num, "ENV requires a key and value"));
    }

    let (first, value) = split_first_word(rest);
    if !first.contains('=') {
        // Legacy form: ENV KEY VALUE
        if value.is_empty() {
            return Err(StratumError::recipe(
                line_num,
                format!("ENV {} requires a value", first),
            ));
        }
        return Ok(Instruction::Env {
            vars: vec![(first.to_string(), unquote(value))],
        });
    }

    Ok(Instruction::Env {
        vars: parse_pairs("ENV", rest, line_num)?,
    })
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(StratumError::recipe(line_num, "LABEL requires key=value"));
    }

    let (first, value) = split_first_word(rest);
    if !first.contains('=') {
        // LABEL key value (legacy)
        return Ok(Instruction::Label {
            labels: vec![(unquote(first), unquote(value))],
        });
    }

    Ok(Instruction::Label {
        labels: parse_pairs("LABEL", rest, line_num)?,
    })
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(StratumError::recipe(line_num, "ARG requires a name"));
    }

    match rest.split_once('=') {
        Some((name, default)) => Ok(Instruction::Arg {
            name: name.trim().to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(Instruction::Arg {
            name: rest.trim().to_string(),
            default: None,
        }),
    }
}

fn parse_exec_form(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(StratumError::recipe(
            line_num,
            format!("{} requires an argument", keyword),
        ));
    }

    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        // Shell form: wrap in sh -c
        Ok(vec!["/bin/sh".to_string(), "-c".to_string(), rest.to_string()])
    }
}

fn first_word(keyword: &str, rest: &str, line_num: usize) -> Result<String> {
    rest.split_whitespace()
        .next()
        .map(str::to_string)
        .ok_or_else(|| StratumError::recipe(line_num, format!("{} requires an argument", keyword)))
}

// --- Helpers ---

/// Parse `KEY=VALUE ...` pairs; every word must contain `=`.
fn parse_pairs(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<(String, String)>> {
    split_words(rest)
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(StratumError::recipe(
                line_num,
                format!("{} expects KEY=VALUE pairs, got '{}'", keyword, word),
            )),
        })
        .collect()
}

/// Parse a JSON array string like `["a", "b", "c"]` into a Vec<String>.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| {
        StratumError::recipe(line_num, format!("invalid JSON array '{}': {}", s, e))
    })
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Split on whitespace, honouring single quotes, double quotes and
/// backslash escapes. Quotes are removed from the resulting words.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

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
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            },
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_word = true;
                }
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- join_continuation_lines ---

    #[test]
    fn test_join_continuation_simple() {
        let input = "RUN apt-get update && \\\n    apt-get install -y curl";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 1);
        assert!(lines[0].1.contains("apt-get update"));
        assert!(lines[0].1.contains("apt-get install"));
    }

    #[test]
    fn test_join_continuation_tracks_physical_lines() {
        let input = "FROM alpine\nRUN a \\\n    b\nRUN c";
        let lines = join_continuation_lines(input);
        let starts: Vec<usize> = lines.iter().map(|(n, _)| *n).collect();
        assert_eq!(starts, vec![1, 2, 4]);
    }

    #[test]
    fn test_join_continuation_skips_inner_comment() {
        let input = "RUN pip install \\\n# pinned below\n    flask";
        let lines = join_continuation_lines(input);
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].1.contains("pinned"));
        assert!(lines[0].1.contains("flask"));
    }

    // --- parse_from ---

    #[test]
    fn test_parse_from_simple() {
        assert_eq!(
            parse_from("python:3.12-slim", 1).unwrap(),
            Instruction::From {
                image: "python:3.12-slim".to_string(),
                alias: None,
            }
        );
    }

    #[test]
    fn test_parse_from_with_alias() {
        assert_eq!(
            parse_from("golang:1.21 AS builder", 1).unwrap(),
            Instruction::From {
                image: "golang:1.21".to_string(),
                alias: Some("builder".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_from_empty() {
        assert!(parse_from("", 1).is_err());
    }

    // --- parse_run ---

    #[test]
    fn test_parse_run_shell() {
        assert_eq!(
            parse_run("pip install -r requirements.txt", 1).unwrap(),
            Instruction::Run {
                command: "pip install -r requirements.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_run_json() {
        assert_eq!(
            parse_run(r#"["npm", "ci"]"#, 1).unwrap(),
            Instruction::Run {
                command: "'npm' 'ci'".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_run_json_keeps_argument_boundaries() {
        assert_eq!(
            parse_run(r#"["/bin/sh", "-c", "echo it's > out.txt"]"#, 1).unwrap(),
            Instruction::Run {
                command: r"'/bin/sh' '-c' 'echo it'\''s > out.txt'".to_string(),
            }
        );
        assert!(parse_run("[]", 1).is_err());
    }

    #[test]
    fn test_parse_run_empty() {
        assert!(parse_run("", 1).is_err());
    }

    // --- parse_copy ---

    #[test]
    fn test_parse_copy_simple() {
        assert_eq!(
            parse_copy("requirements.txt .", 1).unwrap(),
            Instruction::Copy {
                src: vec!["requirements.txt".to_string()],
                dst: ".".to_string(),
                chown: None,
            }
        );
    }

    #[test]
    fn test_parse_copy_multiple_sources_and_chown() {
        assert_eq!(
            parse_copy("--chown=app:app package.json package-lock.json ./", 1).unwrap(),
            Instruction::Copy {
                src: vec!["package.json".to_string(), "package-lock.json".to_string()],
                dst: "./".to_string(),
                chown: Some("app:app".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_copy_json_form() {
        assert_eq!(
            parse_copy(r#"["my file.txt", "/dest/"]"#, 1).unwrap(),
            Instruction::Copy {
                src: vec!["my file.txt".to_string()],
                dst: "/dest/".to_string(),
                chown: None,
            }
        );
    }

    #[test]
    fn test_parse_copy_from_stage_rejected() {
        let err = parse_copy("--from=builder /app/bin /usr/local/bin/", 7).unwrap_err();
        assert!(matches!(err, StratumError::Recipe { line: 7, .. }));
    }

    #[test]
    fn test_parse_copy_single_arg() {
        assert!(parse_copy("onlyone", 1).is_err());
        assert!(parse_copy("", 1).is_err());
    }

    // --- parse_env ---

    #[test]
    fn test_parse_env_equals_multiple() {
        assert_eq!(
            parse_env(r#"PYTHONUNBUFFERED=1 APP_HOME="/srv/my app""#, 1).unwrap(),
            Instruction::Env {
                vars: vec![
                    ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
                    ("APP_HOME".to_string(), "/srv/my app".to_string()),
                ],
            }
        );
    }

    #[test]
    fn test_parse_env_legacy() {
        assert_eq!(
            parse_env("MY_VAR hello world", 1).unwrap(),
            Instruction::Env {
                vars: vec![("MY_VAR".to_string(), "hello world".to_string())],
            }
        );
    }

    #[test]
    fn test_parse_env_invalid_pair() {
        assert!(parse_env("A=1 B", 1).is_err());
        assert!(parse_env("", 1).is_err());
        assert!(parse_env("LONELY", 1).is_err());
    }

    // --- exec forms ---

    #[test]
    fn test_parse_cmd_exec() {
        assert_eq!(
            parse_exec_form("CMD", r#"["python", "app.py"]"#, 1).unwrap(),
            vec!["python".to_string(), "app.py".to_string()]
        );
    }

    #[test]
    fn test_parse_entrypoint_shell() {
        assert_eq!(
            parse_exec_form("ENTRYPOINT", "python app.py", 1).unwrap(),
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "python app.py".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_exec_invalid_json() {
        let err = parse_exec_form("CMD", r#"["python", "#, 4).unwrap_err();
        assert!(matches!(err, StratumError::Recipe { line: 4, .. }));
    }

    // --- label / arg / user / expose ---

    #[test]
    fn test_parse_label_quoted() {
        assert_eq!(
            parse_label(r#"description="My app" version=1.0"#, 1).unwrap(),
            Instruction::Label {
                labels: vec![
                    ("description".to_string(), "My app".to_string()),
                    ("version".to_string(), "1.0".to_string()),
                ],
            }
        );
    }

    #[test]
    fn test_parse_arg_with_default() {
        assert_eq!(
            parse_arg("PY_VERSION=3.12", 1).unwrap(),
            Instruction::Arg {
                name: "PY_VERSION".to_string(),
                default: Some("3.12".to_string()),
            }
        );
        assert_eq!(
            parse_arg("TOKEN", 1).unwrap(),
            Instruction::Arg {
                name: "TOKEN".to_string(),
                default: None,
            }
        );
    }

    #[test]
    fn test_parse_user_and_expose() {
        let recipe = Recipe::parse("FROM alpine\nUSER app:app\nEXPOSE 8080/tcp").unwrap();
        assert_eq!(
            recipe.instructions[1],
            Instruction::User {
                user: "app:app".to_string()
            }
        );
        assert_eq!(
            recipe.instructions[2],
            Instruction::Expose {
                port: "8080/tcp".to_string()
            }
        );
    }

    // --- Full recipe parsing ---

    #[test]
    fn test_parse_layered_recipe_text() {
        let content = r#"
# Dependencies first, source last
FROM python:3.12-slim

WORKDIR /workspace

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

ENV PYTHONUNBUFFERED=1
CMD ["python", "main.py"]
"#;
        let recipe = Recipe::parse(content).unwrap();
        assert_eq!(recipe.instructions.len(), 7);
        assert_eq!(recipe.base_image(), Some("python:3.12-slim"));
        assert!(recipe.layering_warnings().is_empty());
    }

    #[test]
    fn test_parse_unknown_instruction_reports_line() {
        let err = Recipe::parse("FROM alpine\n\nFROBNICATE now").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Recipe error at line 3: unknown instruction 'FROBNICATE'"
        );
    }

    #[test]
    fn test_parse_unsupported_instruction_skipped() {
        let recipe = Recipe::parse("FROM alpine\nVOLUME /data\nRUN true").unwrap();
        assert_eq!(recipe.instructions.len(), 2);
    }

    #[test]
    fn test_parse_lowercase_keywords() {
        let recipe = Recipe::parse("from alpine\nworkdir /app").unwrap();
        assert_eq!(recipe.instructions[1].keyword(), "WORKDIR");
    }

    #[test]
    fn test_parse_empty_recipe() {
        assert!(Recipe::parse("# just a comment\n\n").is_err());
    }

    #[test]
    fn test_parse_no_from() {
        let err = Recipe::parse("RUN echo hello").unwrap_err();
        assert!(matches!(err, StratumError::Recipe { line: 1, .. }));
    }

    #[test]
    fn test_parse_second_from_rejected() {
        let err = Recipe::parse("FROM golang AS build\nRUN go build\nFROM alpine").unwrap_err();
        assert!(matches!(err, StratumError::Recipe { line: 3, .. }));
    }

    #[test]
    fn test_parse_arg_before_from() {
        let recipe = Recipe::parse("ARG VERSION=3.19\nFROM alpine:${VERSION}").unwrap();
        assert_eq!(recipe.instructions.len(), 2);
        assert!(matches!(&recipe.instructions[0], Instruction::Arg { .. }));
    }

    // --- layered / warnings ---

    #[test]
    fn test_layered_recipe_order() {
        let recipe = Recipe::layered(
            "python:3.12-slim",
            "/workspace",
            "requirements.txt",
            "pip install -r requirements.txt",
        );
        let text: Vec<String> = recipe.instructions.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            text,
            vec![
                "FROM python:3.12-slim",
                "WORKDIR /workspace",
                "COPY requirements.txt ./",
                "RUN pip install -r requirements.txt",
                "COPY . .",
            ]
        );
        assert!(recipe.layering_warnings().is_empty());
    }

    #[test]
    fn test_layering_warning_for_install_after_source() {
        let recipe = Recipe::parse(
            "FROM python:3.12\nWORKDIR /workspace\nCOPY . .\nRUN pip install -r requirements.txt",
        )
        .unwrap();
        let warnings = recipe.layering_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("step 4"));
    }

    // --- display ---

    #[test]
    fn test_display_round_trips_through_parser() {
        let content = r#"FROM alpine AS base
ENV A=1 MSG="hello world"
LABEL org.example.team=build
ARG MODE=release
ENTRYPOINT ["/app/run", "--fast"]
COPY --chown=app app.py /srv/"#;
        let recipe = Recipe::parse(content).unwrap();
        let rendered: Vec<String> = recipe.instructions.iter().map(|i| i.to_string()).collect();
        let reparsed = Recipe::parse(&rendered.join("\n")).unwrap();
        assert_eq!(recipe, reparsed);
    }

    // --- helpers ---

    #[test]
    fn test_split_words_quotes() {
        assert_eq!(
            split_words(r#"a "b c" 'd e' f\ g"#),
            vec!["a", "b c", "d e", "f g"]
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(r#""hello world""#), "hello world");
        assert_eq!(unquote("'hello world'"), "hello world");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote(r#""hello'"#), r#""hello'"#);
        assert_eq!(unquote(r#"""#), r#"""#);
    }
}
