//! Delimited field handling for the event wire format.

/// Field delimiter on edge→collector event lines.
pub const EVENT_DELIM: &str = "~|~";

/// Split on a (possibly multi-byte) delimiter, preserving empty
/// segments at either end so join is an exact inverse.
#[must_use]
pub fn split_fields<'a>(s: &'a str, delim: &str) -> Vec<&'a str> {
	s.split(delim).collect()
}

#[must_use]
pub fn join_fields(fields: &[&str], delim: &str) -> String {
	fields.join(delim)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_split_join_round_trip() {
		let line = "req~|~1.2.3.4:80~|~common~|~GET";
		assert_eq!(join_fields(&split_fields(line, EVENT_DELIM), EVENT_DELIM), line);
	}

	#[test]
	fn test_empty_end_segments_survive() {
		let line = "~|~a~|~~|~b~|~";
		let fields = split_fields(line, EVENT_DELIM);
		assert_eq!(fields, vec!["", "a", "", "b", ""]);
		assert_eq!(join_fields(&fields, EVENT_DELIM), line);
	}

	#[test]
	fn test_delimiter_absent_is_single_field() {
		assert_eq!(split_fields("plain", EVENT_DELIM), vec!["plain"]);
	}
}
