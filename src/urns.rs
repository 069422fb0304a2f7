use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TEL_SCHEME: &str = "tel";
pub const WHATSAPP_SCHEME: &str = "whatsapp";
pub const TEAMS_SCHEME: &str = "teams";

// Schemes whose paths carry a leading qualifier that may change over time
// (`teams:<service>:<user>`), so stored identities are matched on the stable tail.
const QUALIFIED_SCHEMES: &[&str] = &[TEAMS_SCHEME];

// Schemes where Brazilian mobile numbers may arrive with or without the ninth digit.
const NINTH_DIGIT_SCHEMES: &[&str] = &[TEL_SCHEME, WHATSAPP_SCHEME];

const BRAZIL_CODE: &str = "55";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Urn {
    scheme: String,
    path: String,
    display: Option<String>,
}

impl Urn {
    pub fn new(scheme: &str, path: &str) -> Result<Self, BackendError> {
        let scheme = scheme.trim().to_lowercase();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BackendError::Malformed(format!("invalid urn scheme: {scheme:?}")));
        }
        let path = normalize_path(&scheme, path);
        if path.is_empty() {
            return Err(BackendError::Malformed(format!("empty urn path for {scheme}")));
        }
        Ok(Self {
            scheme,
            path,
            display: None,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let (body, display) = match raw.split_once('#') {
            Some((body, display)) => (body, Some(display)),
            None => (raw, None),
        };
        let (scheme, path) = body
            .split_once(':')
            .ok_or_else(|| BackendError::Malformed(format!("urn without scheme: {raw:?}")))?;
        let mut urn = Self::new(scheme, path)?;
        urn.display = display.filter(|d| !d.is_empty()).map(|d| d.to_string());
        Ok(urn)
    }

    pub fn with_display(mut self, display: &str) -> Self {
        self.display = Some(display.to_string());
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    pub fn is_qualified(&self) -> bool {
        QUALIFIED_SCHEMES.contains(&self.scheme.as_str())
    }

    pub fn identity_pattern(&self) -> Option<String> {
        if !self.is_qualified() {
            return None;
        }
        let (_, tail) = self.path.rsplit_once(':')?;
        if tail.is_empty() {
            return None;
        }
        Some(format!("{}:%:{}", self.scheme, escape_like(tail)))
    }

    pub fn alternate(&self) -> Option<Urn> {
        if !NINTH_DIGIT_SCHEMES.contains(&self.scheme.as_str()) {
            return None;
        }
        let (prefix, digits) = match self.path.strip_prefix('+') {
            Some(rest) => ("+", rest),
            None => ("", self.path.as_str()),
        };
        if !digits.starts_with(BRAZIL_CODE)
            || !matches!(digits.len(), 12 | 13)
            || !digits.chars().all(|c| c.is_ascii_digit())
        {
            return None;
        }

        // 55 + two digit area code, then the subscriber number
        let (head, subscriber) = digits.split_at(4);
        let alternate = match subscriber.len() {
            9 if subscriber.starts_with('9') => format!("{head}{}", &subscriber[1..]),
            8 if matches!(subscriber.as_bytes()[0], b'6'..=b'9') => format!("{head}9{subscriber}"),
            _ => return None,
        };

        Some(Urn {
            scheme: self.scheme.clone(),
            path: format!("{prefix}{alternate}"),
            display: self.display.clone(),
        })
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        if let Some(display) = &self.display {
            write!(f, "#{display}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Urn {
    type Error = BackendError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Urn::parse(&value)
    }
}

impl From<Urn> for String {
    fn from(urn: Urn) -> Self {
        urn.to_string()
    }
}

pub fn normalize_path(scheme: &str, path: &str) -> String {
    let path = path.trim();
    match scheme {
        TEL_SCHEME => {
            let mut out = String::with_capacity(path.len());
            for (idx, ch) in path.chars().enumerate() {
                if ch.is_ascii_digit() || (idx == 0 && ch == '+') {
                    out.push(ch);
                }
            }
            if out == "+" {
                String::new()
            } else {
                out
            }
        }
        WHATSAPP_SCHEME => path.chars().filter(|c| c.is_ascii_digit()).collect(),
        _ => path.to_string(),
    }
}

fn escape_like(value: &str) -> String {
    value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
