//! WebSocket extension negotiation.
//!
//! # Responsibilities
//! - Split a `Sec-WebSocket-Extensions` value into its descriptors
//! - Parse the `name; var=val; var="quoted \" val"` parameter grammar
//! - Find one named extension among the offered descriptors
//!
//! # Design Decisions
//! - Byte oriented: header values are not required to be UTF-8
//! - A malformed parameter list discards the whole descriptor
//! - Later assignments of the same parameter win

use std::collections::HashMap;

use axum::http::{header::SEC_WEBSOCKET_EXTENSIONS, HeaderMap};
use thiserror::Error;

/// Name of the extension a backend uses to opt in to control handling.
pub const GRIP_EXTENSION: &str = "grip";

/// Errors produced while parsing an extension's parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    /// `var=` with nothing after the equals sign.
    #[error("parameter has no value")]
    MissingValue,

    /// A quoted value was never closed.
    #[error("unterminated quoted value")]
    UnterminatedQuote,

    /// A backslash escape at the very end of the input.
    #[error("escape at end of input")]
    TrailingEscape,
}

/// One negotiated extension and its parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extension {
    pub name: Vec<u8>,
    pub params: HashMap<Vec<u8>, Vec<u8>>,
}

impl Extension {
    /// Look up a parameter value by name.
    pub fn param(&self, name: &str) -> Option<&[u8]> {
        self.params.get(name.as_bytes()).map(Vec::as_slice)
    }

    /// Returns true if the parameter was given, with or without a value.
    pub fn has_param(&self, name: &str) -> bool {
        self.params.contains_key(name.as_bytes())
    }
}

fn find_any(input: &[u8], set: &[u8], start: usize) -> Option<usize> {
    input[start..]
        .iter()
        .position(|c| set.contains(c))
        .map(|at| at + start)
}

/// Parse the parameter part of a descriptor (everything after the first `;`).
pub fn parse_params(input: &[u8]) -> Result<HashMap<Vec<u8>, Vec<u8>>, ExtensionError> {
    let mut out = HashMap::new();

    let mut start = 0;
    while start < input.len() {
        let var;
        let mut val = Vec::new();

        match find_any(input, b"=;", start) {
            Some(at) => {
                var = input[start..at].trim_ascii().to_vec();

                if input[at] == b'=' {
                    let vstart = at + 1;
                    if vstart >= input.len() {
                        return Err(ExtensionError::MissingValue);
                    }

                    if input[vstart] == b'"' {
                        let mut n = vstart + 1;
                        let mut end = None;
                        while n < input.len() {
                            match input[n] {
                                b'\\' => {
                                    n += 1;
                                    if n >= input.len() {
                                        return Err(ExtensionError::TrailingEscape);
                                    }
                                    val.push(input[n]);
                                }
                                b'"' => {
                                    end = Some(n + 1);
                                    break;
                                }
                                c => val.push(c),
                            }
                            n += 1;
                        }

                        let end = end.ok_or(ExtensionError::UnterminatedQuote)?;

                        start = match find_any(input, b";", end) {
                            Some(semi) => semi + 1,
                            None => input.len(),
                        };
                    } else {
                        match find_any(input, b";", vstart) {
                            Some(semi) => {
                                val = input[vstart..semi].trim_ascii().to_vec();
                                start = semi + 1;
                            }
                            None => {
                                val = input[vstart..].trim_ascii().to_vec();
                                start = input.len();
                            }
                        }
                    }
                } else {
                    start = at + 1;
                }
            }
            None => {
                var = input[start..].trim_ascii().to_vec();
                start = input.len();
            }
        }

        out.insert(var, val);
    }

    Ok(out)
}

/// Split a comma separated extension list, ignoring commas inside quotes.
pub fn split_extension_list(value: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut start = 0;

    for (n, &c) in value.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            b'\\' if in_quote => escaped = true,
            b'"' => in_quote = !in_quote,
            b',' if !in_quote => {
                out.push(&value[start..n]);
                start = n + 1;
            }
            _ => {}
        }
    }
    out.push(&value[start..]);

    out.into_iter()
        .map(<[u8]>::trim_ascii)
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Find `name` among the descriptors. Returns `None` when it is absent or
/// its parameters are malformed.
pub fn find_extension<'a, I>(descriptors: I, name: &str) -> Option<Extension>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    for descriptor in descriptors {
        let (head, params) = match descriptor.iter().position(|&c| c == b';') {
            Some(at) => (descriptor[..at].trim_ascii(), Some(&descriptor[at + 1..])),
            None => (descriptor, None),
        };

        if head != name.as_bytes() {
            continue;
        }

        let params = match params {
            Some(raw) => match parse_params(raw) {
                Ok(params) => params,
                Err(e) => {
                    tracing::debug!(extension = name, error = %e, "Ignoring malformed extension");
                    return None;
                }
            },
            None => HashMap::new(),
        };

        return Some(Extension {
            name: name.as_bytes().to_vec(),
            params,
        });
    }

    None
}

/// Collect every descriptor from the `Sec-WebSocket-Extensions` fields.
pub fn extension_descriptors(headers: &HeaderMap) -> Vec<Vec<u8>> {
    headers
        .get_all(SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .flat_map(|value| split_extension_list(value.as_bytes()))
        .map(<[u8]>::to_vec)
        .collect()
}

/// Find `name` in the `Sec-WebSocket-Extensions` fields of a header set.
pub fn find_in_headers(headers: &HeaderMap, name: &str) -> Option<Extension> {
    let descriptors = extension_descriptors(headers);
    find_extension(descriptors.iter().map(Vec::as_slice), name)
}
