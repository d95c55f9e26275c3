use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// CompNode — Execution locality of a value
//
// A CompNode names a device and a stream on it: "cpu0", "gpu1:2" (device 1,
// stream 2), or "xpux" (any device, resolved late by the collaborator).
// The value algebra only records where a tensor lives; it never dispatches
// work to the device itself.

/// Kind of device a comp node refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
    /// Unresolved device ("xpu"): the first available one.
    Xpu,
}

impl DeviceKind {
    fn prefix(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Xpu => "xpu",
        }
    }
}

/// Identifies a device and stream (the payload of a `CompNodeValue`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompNode {
    kind: DeviceKind,
    /// `None` means "x": any device / default stream.
    index: Option<u32>,
    stream: u32,
}

impl CompNode {
    pub fn new(kind: DeviceKind, index: u32, stream: u32) -> Self {
        CompNode {
            kind,
            index: Some(index),
            stream,
        }
    }

    /// `cpu0`, default stream.
    pub fn cpu(index: u32) -> Self {
        CompNode::new(DeviceKind::Cpu, index, 0)
    }

    /// `gpu{index}`, default stream.
    pub fn gpu(index: u32) -> Self {
        CompNode::new(DeviceKind::Gpu, index, 0)
    }

    /// `xpux`: whatever device the collaborator picks.
    pub fn any() -> Self {
        CompNode {
            kind: DeviceKind::Xpu,
            index: None,
            stream: 0,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    /// Same comp node on another stream.
    pub fn with_stream(self, stream: u32) -> Self {
        CompNode { stream, ..self }
    }

    /// Whether memory on this node can be read directly by the host.
    pub fn is_host(&self) -> bool {
        self.kind == DeviceKind::Cpu
    }
}

impl Default for CompNode {
    fn default() -> Self {
        CompNode::cpu(0)
    }
}

impl fmt::Display for CompNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.prefix())?;
        match self.index {
            Some(i) => write!(f, "{}", i)?,
            None => f.write_str("x")?,
        }
        if self.stream != 0 {
            write!(f, ":{}", self.stream)?;
        }
        Ok(())
    }
}

impl FromStr for CompNode {
    type Err = Error;

    /// Parse `cpu0`, `gpu1:2`, `xpux`, `cpux`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::msg(format!("invalid comp node '{}'", s));
        if s.len() < 4 || !s.is_char_boundary(3) {
            return Err(bad());
        }
        let (prefix, rest) = s.split_at(3);
        let kind = match prefix {
            "cpu" => DeviceKind::Cpu,
            "gpu" => DeviceKind::Gpu,
            "xpu" => DeviceKind::Xpu,
            _ => return Err(bad()),
        };
        let (dev, stream) = match rest.split_once(':') {
            Some((dev, stream)) => (dev, stream.parse::<u32>().map_err(|_| bad())?),
            None => (rest, 0),
        };
        let index = match dev {
            "x" => None,
            num => Some(num.parse::<u32>().map_err(|_| bad())?),
        };
        Ok(CompNode {
            kind,
            index,
            stream,
        })
    }
}
