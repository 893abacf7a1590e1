//! Channel names: `{namespace}-{purpose}-{discriminator}`.
//!
//! Names arrive from untrusted peers, so parsing is strict. The namespace may
//! itself contain `-`; the discriminator may not, and may not equal a purpose
//! label. Under those rules every name has exactly one parse.

use std::fmt;
use std::str::FromStr;

use crate::error::NamingError;

const SEPARATOR: char = '-';

/// What a channel is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// Session channel carrying request/response envelopes.
    Control,
    /// Secondary channel carrying one promoted stream.
    Stream,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Stream => "stream",
        }
    }
}

impl FromStr for Purpose {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Self::Control),
            "stream" => Ok(Self::Stream),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated trailing segment of a channel name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Discriminator(String);

impl Discriminator {
    pub fn new(value: impl Into<String>) -> Result<Self, NamingError> {
        let value = value.into();
        if value.is_empty() || value.contains(SEPARATOR) || value.parse::<Purpose>().is_ok() {
            return Err(NamingError::InvalidDiscriminator {
                discriminator: value,
            });
        }
        Ok(Self(value))
    }

    /// A random token; never collides in practice and needs no coordination.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelName {
    namespace: String,
    purpose: Purpose,
    discriminator: Option<Discriminator>,
}

impl ChannelName {
    pub fn new(
        namespace: impl Into<String>,
        purpose: Purpose,
        discriminator: Option<Discriminator>,
    ) -> Result<Self, NamingError> {
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(NamingError::EmptyNamespace);
        }
        Ok(Self {
            namespace,
            purpose,
            discriminator,
        })
    }

    /// A stream channel name with a fresh discriminator.
    pub fn fresh_stream(namespace: &str) -> Result<Self, NamingError> {
        Self::new(namespace, Purpose::Stream, Some(Discriminator::fresh()))
    }

    pub fn parse(name: &str) -> Result<Self, NamingError> {
        let malformed = || NamingError::Malformed {
            name: name.to_string(),
        };

        let (head, last) = name.rsplit_once(SEPARATOR).ok_or_else(malformed)?;
        if let Ok(purpose) = last.parse::<Purpose>() {
            return Self::new(head, purpose, None).map_err(|_| malformed());
        }

        let (namespace, purpose) = head.rsplit_once(SEPARATOR).ok_or_else(malformed)?;
        let purpose = purpose.parse::<Purpose>().map_err(|_| malformed())?;
        let discriminator = Discriminator::new(last).map_err(|_| malformed())?;
        Self::new(namespace, purpose, Some(discriminator)).map_err(|_| malformed())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, SEPARATOR, self.purpose)?;
        if let Some(discriminator) = &self.discriminator {
            write!(f, "{}{}", SEPARATOR, discriminator)?;
        }
        Ok(())
    }
}

impl FromStr for ChannelName {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// `name(namespace, purpose, discriminator)` as a plain string.
pub fn name(
    namespace: &str,
    purpose: Purpose,
    discriminator: Option<&str>,
) -> Result<String, NamingError> {
    let discriminator = discriminator.map(Discriminator::new).transpose()?;
    Ok(ChannelName::new(namespace, purpose, discriminator)?.to_string())
}

/// `parse(name)`.
pub fn parse(name: &str) -> Result<ChannelName, NamingError> {
    ChannelName::parse(name)
}
