//! Resolves `require` specifiers against the source set and emits one Lua
//! chunk.
//!
//! Relative (`./`, `../`) and absolute (`/`) specifiers must resolve to a
//! source row, trying `p`, `p.lua` and `p/init.lua`. Any other specifier is
//! bare and is looked up in the host-provided externals table at run time.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::CompileError;

#[derive(Clone, Debug)]
pub struct Bundle {
    pub entry: String,
    pub text: String,
    /// Module paths in load order, entry first.
    pub modules: Vec<String>,
    pub elapsed: Duration,
}

fn require_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\brequire\s*\(?\s*["']([^"']+)["']\s*\)?"#).expect("require pattern is valid")
    })
}

/// Specifiers referenced by `source`, in order of first appearance.
pub fn scan_requires(source: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    require_pattern()
        .captures_iter(source)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_owned()))
        .filter(|s| seen.insert(s.clone()))
        .collect()
}

pub fn is_bare(specifier: &str) -> bool {
    !(specifier.starts_with("./") || specifier.starts_with("../") || specifier.starts_with('/'))
}

/// Join a relative specifier onto the importer's directory and normalise
/// `.` and `..` segments.
pub fn join_path(importer: &str, specifier: &str) -> String {
    let mut parts: Vec<&str> = if specifier.starts_with('/') {
        Vec::new()
    } else {
        let mut dir: Vec<&str> = importer.split('/').filter(|s| !s.is_empty()).collect();
        dir.pop();
        dir
    };
    for seg in specifier.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn resolve(
    importer: &str,
    specifier: &str,
    sources: &BTreeMap<String, String>,
) -> Result<String, CompileError> {
    let base = join_path(importer, specifier);
    [base.clone(), format!("{base}.lua"), format!("{base}/init.lua")]
        .into_iter()
        .find(|candidate| sources.contains_key(candidate))
        .ok_or_else(|| CompileError::UnresolvedImport {
            specifier: specifier.to_owned(),
            importer: importer.to_owned(),
        })
}

/// Bundle every module reachable from `entry`.
pub fn build(entry: &str, sources: &BTreeMap<String, String>) -> Result<Bundle, CompileError> {
    let started = Instant::now();
    if !sources.contains_key(entry) {
        return Err(CompileError::MissingEntry(entry.to_owned()));
    }

    let mut order: Vec<String> = Vec::new();
    let mut resolved: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack = vec![entry.to_owned()];

    while let Some(path) = stack.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }
        let source = sources.get(&path).ok_or_else(|| CompileError::MissingEntry(path.clone()))?;
        let mut links = Vec::new();
        let mut children = Vec::new();
        for spec in scan_requires(source) {
            if is_bare(&spec) {
                continue;
            }
            let target = resolve(&path, &spec, sources)?;
            links.push((spec, target.clone()));
            children.push(target);
        }
        // Reverse so the first require is visited first.
        stack.extend(children.into_iter().rev());
        resolved.insert(path.clone(), links);
        order.push(path);
    }

    let mut text = String::new();
    text.push_str("local __external = ...\nlocal __modules = {}\nlocal __resolved = {}\n");
    for path in &order {
        let key = lua_string(path);
        let _ = writeln!(text, "__modules[{key}] = function(require)");
        text.push_str(&sources[path]);
        text.push_str("\nend\n");
        let _ = write!(text, "__resolved[{key}] = {{");
        for (spec, target) in &resolved[path] {
            let _ = write!(text, " [{}] = {},", lua_string(spec), lua_string(target));
        }
        text.push_str(" }\n");
    }
    text.push_str(LOADER);
    let _ = writeln!(text, "return __load({})", lua_string(entry));

    Ok(Bundle {
        entry: entry.to_owned(),
        text,
        modules: order,
        elapsed: started.elapsed(),
    })
}

const LOADER: &str = r#"local __cache = {}
local __loading = {}
local function __load(path)
  local cached = __cache[path]
  if cached ~= nil then return cached end
  if __loading[path] then error("circular require: " .. path, 0) end
  __loading[path] = true
  local links = __resolved[path]
  local function require(spec)
    local target = links[spec]
    if target ~= nil then return __load(target) end
    local ext = __external[spec]
    if ext == nil then error("module '" .. spec .. "' is not provided by the host", 0) end
    return ext
  end
  local result = __modules[path](require)
  if result == nil then result = true end
  __cache[path] = result
  __loading[path] = nil
  return result
end
"#;

/// Quote `s` as a Lua string literal.
pub fn lua_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\{}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
