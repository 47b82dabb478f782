use std::{fmt, str::FromStr};

use itertools::Itertools;

/// Characters that have to be escaped anywhere inside an attribute value (RFC 4514, section 2.4).
const SPECIAL_CHARACTERS: &[char] = &[',', '+', '"', '\\', '<', '>', ';', '='];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid distinguished name '{dn}': {reason}")]
pub struct InvalidDn {
    pub dn: String,
    pub reason: &'static str,
}

/// A single `attribute=value` pair of a relative distinguished name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    pub attribute: String,
    pub value: String,
}

impl AttributeValue {
    /// Attribute types compare case-insensitively. We also compare values case-insensitively, which is
    /// what all the directory string attributes we deal with (ou, dc, cn, identifier) do.
    fn matches(&self, other: &Self) -> bool {
        self.attribute.eq_ignore_ascii_case(&other.attribute) && self.value.to_lowercase() == other.value.to_lowercase()
    }
}

/// A relative distinguished name. Usually a single pair, but multi-valued RDNs (`a=1+b=2`) are legal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rdn(Vec<AttributeValue>);

impl Rdn {
    /// The value of the given attribute in this RDN, if present.
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|pair| pair.attribute.eq_ignore_ascii_case(attribute))
            .map(|pair| pair.value.as_str())
    }

    fn matches(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().all(|pair| other.0.iter().any(|o| pair.matches(o)))
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|pair| format!("{}={}", pair.attribute, escape_value(&pair.value)))
            .join("+");
        f.write_str(&joined)
    }
}

/// A parsed distinguished name, most specific RDN first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dn(Vec<Rdn>);

impl Dn {
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first_rdn(&self) -> Option<&Rdn> {
        self.0.first()
    }

    /// How many RDNs this DN lies below `base`, or `None` if it does not lie within the subtree of `base` at all.
    pub fn depth_below(&self, base: &Dn) -> Option<usize> {
        let depth = self.0.len().checked_sub(base.0.len())?;
        self.0[depth..]
            .iter()
            .zip(base.0.iter())
            .all(|(ours, theirs)| ours.matches(theirs))
            .then_some(depth)
    }

    /// Whether this DN is `base` itself or one of its subordinates.
    pub fn is_within(&self, base: &Dn) -> bool {
        self.depth_below(base).is_some()
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.iter().join(","))
    }
}

impl FromStr for Dn {
    type Err = InvalidDn;

    /// Parse the string representation of a DN as described in RFC 4514.
    /// Hex-pair and single character escapes are supported, quoted values are not.
    fn from_str(dn: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InvalidDn { dn: dn.to_string(), reason };
        if dn.trim().is_empty() {
            return Ok(Dn::default());
        }

        let mut rdns = Vec::new();
        let mut pairs = Vec::new();
        let mut chars = dn.chars().peekable();
        loop {
            let mut attribute = String::new();
            loop {
                match chars.next() {
                    Some('=') => break,
                    Some(c) => attribute.push(c),
                    None => return Err(invalid("expected attribute=value")),
                }
            }
            let attribute = attribute.trim();
            if attribute.is_empty() || attribute.contains([',', '+']) {
                return Err(invalid("expected attribute=value"));
            }

            // Raw bytes so that escaped UTF-8 sequences (\C3\A4) can be reassembled.
            let mut value = Vec::new();
            // Length of the value up to and including the last character that must not be trimmed.
            let mut significant_len = 0;
            let mut terminator = None;
            while let Some(c) = chars.next() {
                match c {
                    ',' | '+' => {
                        terminator = Some(c);
                        break;
                    }
                    '\\' => {
                        let escaped = chars.next().ok_or_else(|| invalid("dangling escape"))?;
                        if escaped.is_ascii_hexdigit() {
                            let low = chars.next().filter(char::is_ascii_hexdigit).ok_or_else(|| invalid("invalid hex escape"))?;
                            let byte = u8::from_str_radix(&format!("{escaped}{low}"), 16).map_err(|_| invalid("invalid hex escape"))?;
                            value.push(byte);
                        } else {
                            let mut buf = [0; 4];
                            value.extend_from_slice(escaped.encode_utf8(&mut buf).as_bytes());
                        }
                        significant_len = value.len();
                    }
                    ' ' if value.is_empty() => {}
                    _ => {
                        let mut buf = [0; 4];
                        value.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                        if c != ' ' {
                            significant_len = value.len();
                        }
                    }
                }
            }
            value.truncate(significant_len);
            let value = String::from_utf8(value).map_err(|_| invalid("value is not valid UTF-8"))?;

            pairs.push(AttributeValue {
                attribute: attribute.to_string(),
                value,
            });
            match terminator {
                Some('+') => continue,
                Some(_) => rdns.push(Rdn(std::mem::take(&mut pairs))),
                None => {
                    rdns.push(Rdn(pairs));
                    break;
                }
            }
        }

        Ok(Dn(rdns))
    }
}

/// Escape an attribute value for use inside a DN string.
pub fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs_escape = SPECIAL_CHARACTERS.contains(&c) || (i == 0 && (c == ' ' || c == '#')) || (i == last && c == ' ');
        if needs_escape {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
