pub const TUS_RESUMABLE: &str = "1.0.0";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_EXTENSION: &str = "Upload-Extension";
pub const HEADER_LOCATION: &str = "Location";

pub const EXTENSION_CREATION: &str = "creation";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";
