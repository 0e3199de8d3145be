//! Language registry.
//!
//! Maps a language id to the toolchain descriptor used to compile and run
//! code for it. The table is compiled in: adding a language is a code change,
//! so no caller can point the engine at an arbitrary image at runtime.
//! Operators may only tune the resource caps of existing entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::LanguageOverride;

/// Placeholder for the (possibly rewritten) source filename in step templates.
const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder for the source filename without its extension.
const STEM_PLACEHOLDER: &str = "{stem}";

const MIB: u64 = 1024 * 1024;

/// Modifiers that may sit between `public` and `class` in a Java declaration.
const JAVA_CLASS_MODIFIERS: &[&str] = &["final", "abstract", "strictfp", "static", "sealed"];

/// How the source filename is chosen for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPointRule {
    /// Always use the descriptor's `source_filename`.
    Fixed,
    /// Name the file after the first `public class` in the source.
    JavaPublicClass,
}

/// Immutable description of one language toolchain.
#[derive(Debug, Clone)]
pub struct ToolchainDescriptor {
    pub language_id: String,
    pub name: String,
    pub extension: String,
    /// Container image holding the toolchain.
    pub image: String,
    /// Toolchain binary looked up on `PATH` by the host backend.
    pub binary: String,
    pub source_filename: String,
    /// Shell snippet; `None` for interpreted languages.
    pub compile_step: Option<String>,
    /// Shell snippet; reads standard input from `stdin.in`.
    pub run_step: String,
    pub entry_point: EntryPointRule,
    pub wall_timeout_seconds: u64,
    pub memory_bytes: u64,
    /// Fraction of one core, e.g. `0.5`.
    pub cpu_share: f64,
}

/// Source filename and class/binary stem for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub source_filename: String,
    pub stem: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryPointError {
    #[error("no `public class` declaration found; Java sources must declare a public class")]
    NoPublicClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown language: '{0}'")]
pub struct UnknownLanguage(pub String);

/// Entry of the ordered language listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LanguageSummary {
    pub language_id: String,
    pub name: String,
    pub extension: String,
}

impl ToolchainDescriptor {
    /// Work out the filename the source is written under.
    pub fn entry_point(&self, source: &str) -> Result<EntryPoint, EntryPointError> {
        match self.entry_point {
            EntryPointRule::Fixed => Ok(EntryPoint {
                source_filename: self.source_filename.clone(),
                stem: file_stem(&self.source_filename).to_string(),
            }),
            EntryPointRule::JavaPublicClass => {
                let class = find_public_class(source).ok_or(EntryPointError::NoPublicClass)?;
                Ok(EntryPoint {
                    source_filename: format!("{class}.{}", self.extension),
                    stem: class,
                })
            }
        }
    }

    /// Compile step with placeholders substituted.
    pub fn compile_command(&self, entry: &EntryPoint) -> Option<String> {
        self.compile_step
            .as_deref()
            .map(|template| render(template, entry))
    }

    /// Run step with placeholders substituted.
    pub fn run_command(&self, entry: &EntryPoint) -> String {
        render(&self.run_step, entry)
    }

    pub const fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_timeout_seconds)
    }

    pub const fn has_compile_step(&self) -> bool {
        self.compile_step.is_some()
    }

    fn apply_override(&mut self, over: &LanguageOverride) {
        if let Some(secs) = over.wall_timeout_seconds {
            self.wall_timeout_seconds = secs;
        }
        if let Some(bytes) = over.memory_bytes {
            self.memory_bytes = bytes;
        }
        if let Some(share) = over.cpu_share {
            self.cpu_share = share;
        }
    }
}

fn render(template: &str, entry: &EntryPoint) -> String {
    template
        .replace(SOURCE_PLACEHOLDER, &entry.source_filename)
        .replace(STEM_PLACEHOLDER, &entry.stem)
}

fn file_stem(filename: &str) -> &str {
    filename.rsplit_once('.').map_or(filename, |(stem, _)| stem)
}

fn is_java_identifier(token: &str) -> bool {
    token
        .chars()
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
}

/// Java source with comments and string, char and text-block literals
/// replaced by spaces, so only code tokens remain.
fn java_code_only(source: &str) -> String {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Span {
        Code,
        LineComment,
        BlockComment,
        Quoted(char),
        TextBlock,
    }

    let mut out = String::with_capacity(source.len());
    let mut span = Span::Code;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match span {
            Span::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    span = Span::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    span = Span::BlockComment;
                }
                '"' if source_continues_with(&chars, "\"\"") => {
                    chars.next();
                    chars.next();
                    span = Span::TextBlock;
                }
                '"' | '\'' => span = Span::Quoted(c),
                _ => {
                    out.push(c);
                    continue;
                }
            },
            Span::LineComment => {
                if c == '\n' {
                    span = Span::Code;
                }
            }
            Span::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    span = Span::Code;
                }
            }
            Span::Quoted(quote) => {
                if c == '\\' {
                    chars.next();
                } else if c == quote || c == '\n' {
                    span = Span::Code;
                }
            }
            Span::TextBlock => {
                if c == '\\' {
                    chars.next();
                } else if c == '"' && source_continues_with(&chars, "\"\"") {
                    chars.next();
                    chars.next();
                    span = Span::Code;
                }
            }
        }
        out.push(' ');
    }
    out
}

fn source_continues_with(chars: &std::iter::Peekable<std::str::Chars<'_>>, expected: &str) -> bool {
    chars.clone().take(expected.len()).eq(expected.chars())
}

/// Find the name of the first `public class` declared in a Java source.
fn find_public_class(source: &str) -> Option<String> {
    let code = java_code_only(source);
    let mut tokens = code
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .filter(|t| !t.is_empty());

    while let Some(token) = tokens.next() {
        if token != "public" {
            continue;
        }
        let mut next = tokens.next();
        while next.is_some_and(|t| JAVA_CLASS_MODIFIERS.contains(&t)) {
            next = tokens.next();
        }
        if next == Some("class") {
            if let Some(name) = tokens.next().filter(|t| is_java_identifier(t)) {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Compiled-in toolchain row.
struct Builtin {
    id: &'static str,
    name: &'static str,
    extension: &'static str,
    image: &'static str,
    binary: &'static str,
    source: &'static str,
    compile: Option<&'static str>,
    run: &'static str,
    entry_point: EntryPointRule,
    timeout_seconds: u64,
    memory_mib: u64,
    cpu_share: f64,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "python",
        name: "Python 3",
        extension: "py",
        image: "python:3.12-slim",
        binary: "python3",
        source: "main.py",
        compile: None,
        run: "python3 -u {source} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 10,
        memory_mib: 256,
        cpu_share: 0.5,
    },
    Builtin {
        id: "javascript",
        name: "JavaScript (Node.js)",
        extension: "js",
        image: "node:20-slim",
        binary: "node",
        source: "main.js",
        compile: None,
        run: "node {source} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 10,
        memory_mib: 256,
        cpu_share: 0.5,
    },
    Builtin {
        id: "c",
        name: "C (GCC)",
        extension: "c",
        image: "gcc:13",
        binary: "gcc",
        source: "main.c",
        compile: Some("gcc -O2 -std=c17 -o {stem} {source} -lm"),
        run: "./{stem} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 15,
        memory_mib: 256,
        cpu_share: 0.5,
    },
    Builtin {
        id: "cpp",
        name: "C++ (G++)",
        extension: "cpp",
        image: "gcc:13",
        binary: "g++",
        source: "main.cpp",
        compile: Some("g++ -O2 -std=c++17 -o {stem} {source}"),
        run: "./{stem} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 15,
        memory_mib: 512,
        cpu_share: 0.5,
    },
    Builtin {
        id: "java",
        name: "Java",
        extension: "java",
        image: "eclipse-temurin:21-jdk",
        binary: "javac",
        source: "Main.java",
        compile: Some("javac -encoding UTF-8 {source}"),
        run: "java -Xss64m -XX:+UseSerialGC -cp . {stem} < stdin.in",
        entry_point: EntryPointRule::JavaPublicClass,
        timeout_seconds: 20,
        memory_mib: 512,
        cpu_share: 1.0,
    },
    Builtin {
        id: "go",
        name: "Go",
        extension: "go",
        image: "golang:1.22-alpine",
        binary: "go",
        source: "main.go",
        compile: Some("go build -o {stem} {source}"),
        run: "./{stem} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 20,
        memory_mib: 512,
        cpu_share: 1.0,
    },
    Builtin {
        id: "rust",
        name: "Rust",
        extension: "rs",
        image: "rust:1.78-slim",
        binary: "rustc",
        source: "main.rs",
        compile: Some("rustc -O -o {stem} {source}"),
        run: "./{stem} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 30,
        memory_mib: 512,
        cpu_share: 1.0,
    },
    Builtin {
        id: "bash",
        name: "Bash",
        extension: "sh",
        image: "bash:5.2",
        binary: "bash",
        source: "main.sh",
        compile: None,
        run: "bash {source} < stdin.in",
        entry_point: EntryPointRule::Fixed,
        timeout_seconds: 10,
        memory_mib: 128,
        cpu_share: 0.5,
    },
];

impl From<&Builtin> for ToolchainDescriptor {
    fn from(b: &Builtin) -> Self {
        Self {
            language_id: b.id.to_string(),
            name: b.name.to_string(),
            extension: b.extension.to_string(),
            image: b.image.to_string(),
            binary: b.binary.to_string(),
            source_filename: b.source.to_string(),
            compile_step: b.compile.map(str::to_string),
            run_step: b.run.to_string(),
            entry_point: b.entry_point,
            wall_timeout_seconds: b.timeout_seconds,
            memory_bytes: b.memory_mib * MIB,
            cpu_share: b.cpu_share,
        }
    }
}

/// Read-only mapping from language id to toolchain descriptor.
///
/// Built once at startup; lookups need no locking.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    descriptors: Vec<Arc<ToolchainDescriptor>>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    /// Registry holding the compiled-in toolchain table.
    pub fn builtin() -> Self {
        Self::new(BUILTINS.iter().map(ToolchainDescriptor::from).collect())
    }

    /// Build a registry from descriptors. A later descriptor with the same id
    /// replaces the earlier one in place.
    pub fn new(descriptors: Vec<ToolchainDescriptor>) -> Self {
        let mut registry = Self {
            descriptors: Vec::with_capacity(descriptors.len()),
            index: HashMap::new(),
        };
        for descriptor in descriptors {
            let id = descriptor.language_id.to_ascii_lowercase();
            let descriptor = Arc::new(descriptor);
            if let Some(&slot) = registry.index.get(&id) {
                registry.descriptors[slot] = descriptor;
            } else {
                registry.index.insert(id, registry.descriptors.len());
                registry.descriptors.push(descriptor);
            }
        }
        registry
    }

    /// Apply per-language resource overrides. Unknown ids are logged and skipped.
    #[must_use]
    pub fn with_overrides(mut self, overrides: &HashMap<String, LanguageOverride>) -> Self {
        for (id, over) in overrides {
            let Some(&slot) = self.index.get(&id.to_ascii_lowercase()) else {
                warn!(language = %id, "Ignoring override for unknown language");
                continue;
            };
            Arc::make_mut(&mut self.descriptors[slot]).apply_override(over);
        }
        self
    }

    pub fn resolve(&self, language_id: &str) -> Result<Arc<ToolchainDescriptor>, UnknownLanguage> {
        self.index
            .get(&language_id.to_ascii_lowercase())
            .map(|&slot| Arc::clone(&self.descriptors[slot]))
            .ok_or_else(|| UnknownLanguage(language_id.to_string()))
    }

    /// Languages in registration order.
    pub fn list(&self) -> Vec<LanguageSummary> {
        self.descriptors
            .iter()
            .map(|d| LanguageSummary {
                language_id: d.language_id.clone(),
                name: d.name.clone(),
                extension: d.extension.clone(),
            })
            .collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<ToolchainDescriptor>> {
        self.descriptors.iter()
    }
}
