/// Default folder that uploaded photos land in.
pub const DEFAULT_UPLOAD_FOLDER: &str = "uploads";

/// Name used when the multipart field carries no filename.
pub const UNNAMED_FILE: &str = "unnamed";

/// Returns the substring after the last `.` of `file_name`, or an empty
/// string when there is no dot.
pub fn file_extension(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(idx) => &file_name[idx + 1..],
        None => "",
    }
}

/// Builds `<folder>/<task_id>.<extension>`, dropping the `.<extension>`
/// suffix entirely when the extension is empty.
pub fn storage_key(folder: &str, task_id: &str, extension: &str) -> String {
    let folder = folder.trim_end_matches('/');
    let file_name = if extension.is_empty() {
        task_id.to_string()
    } else {
        format!("{}.{}", task_id, extension)
    };

    if folder.is_empty() {
        file_name
    } else {
        format!("{}/{}", folder, file_name)
    }
}
