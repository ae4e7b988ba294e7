use std::ops::Deref;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

/// Strng is a cheaply-clonable, immutable string backed by a shared buffer.
pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	arcstr::ArcStr::from(s.as_ref())
}

pub const EMPTY: Strng = literal!("");

/// RichStrng wraps Strng to provide additional integrations with third party libraries
/// (such as metrics label encoding).
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn inner(&self) -> Strng {
		self.0.clone()
	}
}

impl<T: Into<Strng>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl Deref for RichStrng {
	type Target = Strng;

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl EncodeLabelValue for RichStrng {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		writer.write_str(self.0.as_ref())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shared_buffers() {
		let a = new("agent-a");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_ptr(), b.as_ptr());
	}
}
