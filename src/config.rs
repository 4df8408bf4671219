//! Stack specification parsing.
//!
//! A stack specification names the protocol layers from the application
//! side down to the transport:
//!
//! ```text
//! mux(service=a),relpkt,msgdelim,serialdev,/dev/ttyPipeA0,9600N81
//! certauth(username=u),ssl(CA=ca),tcp,localhost,3023
//! telnet(rfc2217),3023            (accepter, implicit tcp)
//! ```
//!
//! Top-level commas inside parentheses or double quotes do not split.
//! Parameter validation is done by the layer that owns the parameters.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Names of the protocol layers a specification may stack.
pub const LAYER_NAMES: &[&str] = &["mux", "relpkt", "msgdelim", "telnet", "ssl", "certauth"];

/// Which side of a layer's protocol this end plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Client,
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Client => write!(f, "client"),
            Mode::Server => write!(f, "server"),
        }
    }
}

/// Ordered `key[=value]` parameters of one layer or transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    /// Parse a comma separated parameter list (the text between parens).
    pub fn parse(s: &str) -> Result<Self> {
        let mut out = Vec::new();
        for item in split_top_level(s)? {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((k, v)) => {
                    let k = k.trim();
                    if k.is_empty() {
                        return Err(Error::config(format!("empty parameter name in '{}'", item)));
                    }
                    out.push((k.to_string(), Some(unquote(v.trim()).to_string())));
                }
                None => out.push((item.to_string(), None)),
            }
        }
        Ok(Params(out))
    }

    /// Build parameters from `key=value` strings, as passed to `alloc_channel`.
    pub fn from_args(args: &[&str]) -> Result<Self> {
        Self::parse(&args.join(","))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Last value given for `key`. A bare key yields `Some("")`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_deref().unwrap_or(""))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Fail on any key not in `allowed`.
    pub fn check_keys(&self, owner: &str, allowed: &[&str]) -> Result<()> {
        for (k, _) in &self.0 {
            if !allowed.contains(&k.as_str()) {
                return Err(Error::config(format!("{}: unknown parameter '{}'", owner, k)));
            }
        }
        Ok(())
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    /// Boolean parameter: a bare key means true.
    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => parse_bool(v).ok_or_else(|| {
                Error::config(format!("invalid boolean '{}' for '{}'", v, key))
            }),
        }
    }

    /// Numeric parameter.
    pub fn num<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .parse()
                .map_err(|_| Error::config(format!("invalid number '{}' for '{}'", v, key))),
        }
    }

    /// The `mode` parameter, or `default` when absent.
    pub fn mode(&self, default: Mode) -> Result<Mode> {
        match self.get("mode") {
            None => Ok(default),
            Some("client") => Ok(Mode::Client),
            Some("server") => Ok(Mode::Server),
            Some(v) => Err(Error::config(format!("invalid mode '{}'", v))),
        }
    }
}

/// One protocol layer in a stack specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSpec {
    pub name: String,
    pub params: Params,
}

/// The transport at the bottom of a stack specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub name: String,
    pub params: Params,
    /// Positional arguments following the transport name.
    pub args: Vec<String>,
}

/// A parsed stack specification: layers outermost first, then the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpec {
    pub layers: Vec<LayerSpec>,
    pub transport: TransportSpec,
}

impl StackSpec {
    /// Parse a specification string.
    pub fn parse(s: &str) -> Result<Self> {
        let tokens = split_top_level(s)?;
        let mut layers = Vec::new();
        let mut rest = tokens.iter().map(|t| t.trim()).peekable();

        while let Some(tok) = rest.peek() {
            let (name, params) = split_name(tok)?;
            if !LAYER_NAMES.contains(&name) {
                break;
            }
            layers.push(LayerSpec {
                name: name.to_string(),
                params: Params::parse(params)?,
            });
            rest.next();
        }

        let first = rest
            .next()
            .ok_or_else(|| Error::config(format!("'{}': missing transport", s)))?;
        let (name, params) = split_name(first)?;
        if name.is_empty() {
            return Err(Error::config(format!("'{}': empty transport name", s)));
        }
        let mut args: Vec<String> = rest.map(|a| unquote(a).to_string()).collect();

        // A bare port number means tcp, as in "telnet,3023".
        let transport = if name.parse::<u16>().is_ok() && params.is_empty() {
            args.insert(0, name.to_string());
            TransportSpec { name: "tcp".to_string(), params: Params::default(), args }
        } else {
            TransportSpec { name: name.to_string(), params: Params::parse(params)?, args }
        };

        let spec = StackSpec { layers, transport };
        spec.validate()?;
        Ok(spec)
    }

    /// Structural checks that do not depend on a single layer.
    pub fn validate(&self) -> Result<()> {
        if let Some(pos) = self.layers.iter().position(|l| l.name == "mux") {
            if pos != 0 {
                return Err(Error::config("mux must be the outermost layer"));
            }
        }
        Ok(())
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layers.iter().any(|l| l.name == name)
    }
}

impl fmt::Display for StackSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for l in &self.layers {
            write!(f, "{}", l.name)?;
            if !l.params.is_empty() {
                write!(f, "({})", join_params(&l.params))?;
            }
            write!(f, ",")?;
        }
        write!(f, "{}", self.transport.name)?;
        if !self.transport.params.is_empty() {
            write!(f, "({})", join_params(&self.transport.params))?;
        }
        for a in &self.transport.args {
            write!(f, ",{}", a)?;
        }
        Ok(())
    }
}

fn join_params(p: &Params) -> String {
    p.iter()
        .map(|(k, v)| match v {
            Some(v) if v.contains(',') => format!("{}=\"{}\"", k, v),
            Some(v) => format!("{}={}", k, v),
            None => k.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Split `name(params)` into its parts.
fn split_name(tok: &str) -> Result<(&str, &str)> {
    match tok.find('(') {
        None => Ok((tok, "")),
        Some(open) => {
            if !tok.ends_with(')') {
                return Err(Error::config(format!("'{}': unbalanced parenthesis", tok)));
            }
            Ok((tok[..open].trim(), &tok[open + 1..tok.len() - 1]))
        }
    }
}

/// Split on commas that are not inside parentheses or double quotes.
fn split_top_level(s: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| Error::config(format!("'{}': unbalanced parenthesis", s)))?;
            }
            ',' if !quoted && depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || quoted {
        return Err(Error::config(format!("'{}': unterminated group", s)));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn unquote(v: &str) -> &str {
    if v.len() >= 2 && v.starts_with('"') && v.ends_with('"') {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

pub(crate) fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "" | "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}
