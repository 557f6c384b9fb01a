use std::fmt;
use std::ops::Deref;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A wrapper that zeroizes its contents on drop.
///
/// Derived cipher and MAC keys only live for the duration of one
/// encrypt or decrypt operation; wrapping them keeps the key material
/// out of `Debug` output and wipes it when the operation ends.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret<T: Zeroize>(T);

impl<T> Secret<T>
where
    T: Zeroize,
{
    /// Wrap a value.
    pub fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> AsRef<T> for Secret<T>
where
    T: Zeroize,
{
    fn as_ref(&self) -> &T {
        &self.0
    }
}

impl<T> Deref for Secret<T>
where
    T: Zeroize,
{
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for Secret<T>
where
    T: Zeroize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never leak the wrapped value
        write!(f, "Secret(***)")
    }
}
