/// Map a file extension to its MIME content type.
pub fn content_type_for_extension(ext: &str) -> &'static str {
    match ext.to_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// File name a remote URL should be saved under.
///
/// Drops the query string and fragment, percent-decodes the last path
/// segment, and keeps only what follows the last `/` of the decoded value
/// (blob-store URLs encode the whole object key into one segment).
pub fn url_basename(url: &str) -> Option<String> {
    let segment = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .last()?
            .to_string(),
        Err(_) => {
            let path = url.split(['?', '#']).next().unwrap_or(url);
            path.trim_end_matches('/').rsplit('/').next()?.to_string()
        }
    };

    let decoded = urlencoding::decode(&segment).ok()?;
    let name = decoded.rsplit(['/', '\\']).next()?.trim();

    if name.is_empty() || name == "." || name == ".." || name.contains(':') {
        return None;
    }
    Some(name.to_string())
}

/// File extension of a local reference or URL, lowercased, without the dot.
pub fn extension_of(reference: &str) -> Option<String> {
    let name = url_basename(reference)?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}
