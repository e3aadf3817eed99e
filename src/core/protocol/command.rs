// src/core/protocol/command.rs

//! Defines the outgoing command representation and its argument conversions.

use bytes::Bytes;
use std::fmt;

/// A command name plus its arguments, sent on the wire as an array of bulk strings.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    name: Bytes,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Self {
        Self {
            name: name.to_arg(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.args.push(arg.to_arg());
        self
    }

    /// Appends every argument produced by the iterator.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: ToArg,
    {
        self.args.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// Builds a command from already split parts, as typed on a command line.
    /// Returns `None` for an empty slice.
    pub fn from_parts<A: ToArg + Clone>(parts: &[A]) -> Option<Self> {
        let (name, rest) = parts.split_first()?;
        Some(Self::new(name.clone()).args(rest.iter().cloned()))
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The command name as upper-case text, for logging and comparisons.
    pub fn name_upper(&self) -> String {
        String::from_utf8_lossy(&self.name).to_ascii_uppercase()
    }

    pub fn arguments(&self) -> &[Bytes] {
        &self.args
    }

    /// Number of bulk strings this command occupies on the wire.
    pub fn wire_len(&self) -> usize {
        self.args.len() + 1
    }

    /// Name followed by arguments.
    pub fn parts(&self) -> impl Iterator<Item = &Bytes> {
        std::iter::once(&self.name).chain(self.args.iter())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for part in self.parts() {
            list.entry(&String::from_utf8_lossy(part));
        }
        list.finish()
    }
}

/// Conversion of a value into one raw command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

macro_rules! int_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    let mut buf = itoa::Buffer::new();
                    Bytes::copy_from_slice(buf.format(*self).as_bytes())
                }
            }
        )*
    };
}

int_to_arg!(i32, i64, u16, u32, u64, usize, isize);

impl ToArg for f64 {
    fn to_arg(&self) -> Bytes {
        if self.is_infinite() {
            return Bytes::from_static(if *self > 0.0 { b"+inf" } else { b"-inf" });
        }
        let mut buf = ryu::Buffer::new();
        Bytes::copy_from_slice(buf.format(*self).as_bytes())
    }
}
