use std::fmt;
use std::str::FromStr;

/// Coarse category for protocol operations that are disproportionately
/// expensive for the backend, so they can carry narrower limits than the
/// plain verb. Anything outside the allowlist is unclassified.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpClass {
	ListBuckets,
	ListObjects,
	DeleteObjects,
	ListUploads,
}

impl OpClass {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::ListBuckets => "LISTBUCKETS",
			Self::ListObjects => "LISTOBJECTS",
			Self::DeleteObjects => "DELETEOBJECTS",
			Self::ListUploads => "LISTUPLOADS",
		}
	}
}

impl fmt::Display for OpClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OpClass {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"LISTBUCKETS" => Ok(Self::ListBuckets),
			"LISTOBJECTS" => Ok(Self::ListObjects),
			"DELETEOBJECTS" => Ok(Self::DeleteObjects),
			"LISTUPLOADS" => Ok(Self::ListUploads),
			_ => Err(()),
		}
	}
}

/// Classify a request. The table keys off the method, the presence of
/// marker query parameters, and whether the URL trims to a bucket-only
/// path (no object component).
#[must_use]
pub fn classify(method: &str, path: &str, query: Option<&str>) -> Option<OpClass> {
	let bucket_only = is_bucket_only_path(path);
	match method {
		"POST" if query.is_some_and(|q| has_query_key(q, "delete")) => Some(OpClass::DeleteObjects),
		"GET" if bucket_only => {
			if is_root_path(path) {
				Some(OpClass::ListBuckets)
			} else if query.is_some_and(|q| has_query_key(q, "uploads")) {
				Some(OpClass::ListUploads)
			} else {
				Some(OpClass::ListObjects)
			}
		}
		_ => None,
	}
}

fn is_root_path(path: &str) -> bool {
	path.trim_end_matches('/').is_empty()
}

fn is_bucket_only_path(path: &str) -> bool {
	let trimmed = path.trim_start_matches('/').trim_end_matches('/');
	!trimmed.contains('/')
}

fn has_query_key(query: &str, key: &str) -> bool {
	query.split('&').any(|pair| {
		let k = pair.split('=').next().unwrap_or(pair);
		k == key
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_root_get_is_list_buckets() {
		assert_eq!(classify("GET", "/", None), Some(OpClass::ListBuckets));
	}

	#[test]
	fn test_bucket_get_is_list_objects() {
		assert_eq!(classify("GET", "/photos", None), Some(OpClass::ListObjects));
		assert_eq!(classify("GET", "/photos/", Some("prefix=2024")), Some(OpClass::ListObjects));
	}

	#[test]
	fn test_bucket_uploads_query_is_list_uploads() {
		assert_eq!(classify("GET", "/photos", Some("uploads")), Some(OpClass::ListUploads));
		assert_eq!(classify("GET", "/photos", Some("uploads=&max-uploads=10")), Some(OpClass::ListUploads));
	}

	#[test]
	fn test_post_delete_query_is_delete_objects() {
		assert_eq!(classify("POST", "/photos", Some("delete")), Some(OpClass::DeleteObjects));
		assert_eq!(classify("POST", "/photos/obj", Some("delete=")), Some(OpClass::DeleteObjects));
	}

	#[test]
	fn test_object_paths_are_unclassified() {
		assert_eq!(classify("GET", "/photos/2024/cat.jpg", None), None);
		assert_eq!(classify("PUT", "/photos/cat.jpg", None), None);
		assert_eq!(classify("DELETE", "/photos/cat.jpg", None), None);
	}

	#[test]
	fn test_round_trip_names() {
		for class in [OpClass::ListBuckets, OpClass::ListObjects, OpClass::DeleteObjects, OpClass::ListUploads] {
			assert_eq!(class.as_str().parse::<OpClass>().unwrap(), class);
		}
		assert!("COPYOBJECT".parse::<OpClass>().is_err());
	}
}
