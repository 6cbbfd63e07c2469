//! Domain name helpers.
//!
//! Names travel through the library as dotted strings that keep their
//! original casing and end with the root label rendered as a trailing dot
//! (`"Box._http._tcp.local."`). DNS compares names case-insensitively, so
//! every comparison goes through the helpers here instead of `==`.

/// Ensure the name carries its trailing root dot.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// The name without its trailing root dot.
pub fn trimmed(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

/// The labels of a name, root label excluded.
pub fn labels(name: &str) -> impl Iterator<Item = &str> {
    let body = trimmed(name);
    body.split('.').filter(|label| !label.is_empty())
}

/// Case-insensitive name equality, indifferent to the trailing dot.
pub fn eq_ignore_case(left: &str, right: &str) -> bool {
    trimmed(left).eq_ignore_ascii_case(trimmed(right))
}

/// Canonical key form: uppercased, fully qualified.
pub fn key(name: &str) -> String {
    let mut out = trimmed(name).to_ascii_uppercase();
    out.push('.');
    out
}

/// Split off the leftmost label: `"Box._http._tcp.local."` becomes
/// `("Box", "_http._tcp.local.")`.
pub fn split_first_label(name: &str) -> Option<(&str, &str)> {
    let body = trimmed(name);
    let (head, tail) = body.split_once('.')?;
    if head.is_empty() || tail.is_empty() {
        return None;
    }
    // the tail keeps the root dot from the original or gains one
    match name.strip_suffix('.') {
        Some(_) => Some((head, &name[head.len() + 1..])),
        None => Some((head, tail)),
    }
}

/// Labels in raw wire form, without compression. Used where a canonical
/// byte rendition of a name is needed outside a packet.
pub fn write_labels(name: &str, out: &mut Vec<u8>) {
    for label in labels(name) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
}
