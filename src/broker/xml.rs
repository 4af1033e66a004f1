//! S3 multipart XML documents
//!
//! Parsing of the broker's `InitiateMultipartUploadResult` and
//! `CompleteMultipartUploadResult` bodies, and the byte-exact
//! `CompleteMultipartUpload` manifest sent on completion.

use super::{BrokerError, UploadResult, UploadedPart};
use quick_xml::escape::partial_escape;
use serde::Deserialize;
use std::borrow::Cow;

/// S3 API namespace carried by the completion manifest
pub const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

#[derive(Debug, Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId", default)]
    upload_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteMultipartUploadResult {
    #[serde(rename = "Location", default)]
    location: Option<String>,
    #[serde(rename = "Bucket", default)]
    bucket: Option<String>,
    #[serde(rename = "Key", default)]
    key: Option<String>,
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
    #[serde(rename = "ChecksumCRC64NVME", default)]
    checksum_crc64nvme: Option<String>,
    #[serde(rename = "ChecksumType", default)]
    checksum_type: Option<String>,
    // Present when the store reports a failure inside a 200 response
    #[serde(rename = "Code", default)]
    code: Option<String>,
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

/// Extract the upload id from an `InitiateMultipartUploadResult` body
pub fn parse_initiate(body: &str) -> Result<String, BrokerError> {
    let result: InitiateMultipartUploadResult =
        quick_xml::de::from_str(body).map_err(|e| BrokerError::Malformed {
            operation: "creatempu",
            message: e.to_string(),
        })?;

    result
        .upload_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(BrokerError::MissingField {
            operation: "creatempu",
            field: "UploadId",
        })
}

/// Parse a `CompleteMultipartUploadResult` body
pub fn parse_complete(body: &str) -> Result<UploadResult, BrokerError> {
    let result: CompleteMultipartUploadResult =
        quick_xml::de::from_str(body).map_err(|e| BrokerError::Malformed {
            operation: "completempu",
            message: e.to_string(),
        })?;

    if let Some(code) = result.code {
        return Err(BrokerError::Remote {
            operation: "completempu",
            code,
            message: result.message.unwrap_or_default(),
        });
    }

    let location = required("Location", result.location)?;
    let etag = required("ETag", result.etag)?;

    Ok(UploadResult {
        location,
        bucket: result.bucket.unwrap_or_default(),
        key: result.key.unwrap_or_default(),
        etag,
        checksum_crc64nvme: result.checksum_crc64nvme,
        checksum_type: result.checksum_type,
    })
}

fn required(field: &'static str, value: Option<String>) -> Result<String, BrokerError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(BrokerError::MissingField {
            operation: "completempu",
            field,
        })
}

/// Wrap an entity tag in double quotes unless it already is
pub fn quote_etag(etag: &str) -> Cow<'_, str> {
    if etag.len() >= 2 && etag.starts_with('"') && etag.ends_with('"') {
        Cow::Borrowed(etag)
    } else {
        Cow::Owned(format!("\"{}\"", etag))
    }
}

/// Build the `CompleteMultipartUpload` body for `parts`, in the given order.
///
/// The protocol needs at least one part, so an empty list is rejected.
pub fn completion_manifest(parts: &[UploadedPart]) -> Result<String, BrokerError> {
    if parts.is_empty() {
        return Err(BrokerError::EmptyManifest);
    }

    let mut xml = String::with_capacity(128 + parts.len() * 96);
    xml.push_str(XML_DECLARATION);
    xml.push_str(&format!(r#"<CompleteMultipartUpload xmlns="{}">"#, S3_XMLNS));
    for part in parts {
        let etag = quote_etag(&part.etag);
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.part_number,
            partial_escape(etag.as_ref())
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    Ok(xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(part_number: u32, etag: &str) -> UploadedPart {
        UploadedPart {
            part_number,
            etag: etag.to_string(),
        }
    }

    #[test]
    fn test_manifest_is_byte_exact() {
        let xml = completion_manifest(&[part(1, "abc"), part(2, "def")]).unwrap();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <CompleteMultipartUpload xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\
             <Part><PartNumber>1</PartNumber><ETag>\"abc\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"def\"</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }

    #[test]
    fn test_manifest_keeps_quoted_tags() {
        let xml = completion_manifest(&[part(1, "\"abc\"")]).unwrap();
        assert!(xml.contains("<ETag>\"abc\"</ETag>"));
        assert!(!xml.contains("\"\"abc"));
    }

    #[test]
    fn test_manifest_rejects_empty() {
        assert!(matches!(
            completion_manifest(&[]),
            Err(BrokerError::EmptyManifest)
        ));
    }

    #[test]
    fn test_quote_etag() {
        assert_eq!(quote_etag("abc"), "\"abc\"");
        assert_eq!(quote_etag("\"abc\""), "\"abc\"");
        assert_eq!(quote_etag("\""), "\"\"\"");
        assert_eq!(quote_etag(""), "\"\"");
    }

    #[test]
    fn test_parse_initiate() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <InitiateMultipartUploadResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
                <Bucket>reads</Bucket>
                <Key>run-1/archive.tar</Key>
                <UploadId>VXBsb2FkIElE</UploadId>
            </InitiateMultipartUploadResult>"#;
        assert_eq!(parse_initiate(body).unwrap(), "VXBsb2FkIElE");
    }

    #[test]
    fn test_parse_initiate_missing_upload_id() {
        let body = "<InitiateMultipartUploadResult><Bucket>b</Bucket></InitiateMultipartUploadResult>";
        assert!(matches!(
            parse_initiate(body),
            Err(BrokerError::MissingField {
                field: "UploadId",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_initiate_garbage() {
        assert!(parse_initiate("not xml at all <<<").is_err());
    }

    #[test]
    fn test_parse_complete() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <CompleteMultipartUploadResult>
                <Location>https://store.example.com/reads/run-1.tar</Location>
                <Bucket>reads</Bucket>
                <Key>run-1.tar</Key>
                <ETag>"3858f62230ac3c915f300c664312c11f-2"</ETag>
                <ChecksumCRC64NVME>AAAAAAAAAAA=</ChecksumCRC64NVME>
                <ChecksumType>FULL_OBJECT</ChecksumType>
            </CompleteMultipartUploadResult>"#;
        let result = parse_complete(body).unwrap();
        assert_eq!(result.location, "https://store.example.com/reads/run-1.tar");
        assert_eq!(result.bucket, "reads");
        assert_eq!(result.key, "run-1.tar");
        assert_eq!(result.etag, "\"3858f62230ac3c915f300c664312c11f-2\"");
        assert_eq!(result.checksum_crc64nvme.as_deref(), Some("AAAAAAAAAAA="));
        assert_eq!(result.checksum_type.as_deref(), Some("FULL_OBJECT"));
    }

    #[test]
    fn test_parse_complete_rejects_other_documents() {
        assert!(matches!(
            parse_complete("<html><body>ok</body></html>"),
            Err(BrokerError::MissingField {
                operation: "completempu",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_complete_requires_fields() {
        assert!(matches!(
            parse_complete("<CompleteMultipartUploadResult/>"),
            Err(BrokerError::MissingField {
                field: "Location",
                ..
            })
        ));

        let body = "<CompleteMultipartUploadResult>\
                    <Location>https://store/reads/run-1.tar</Location>\
                    </CompleteMultipartUploadResult>";
        assert!(matches!(
            parse_complete(body),
            Err(BrokerError::MissingField { field: "ETag", .. })
        ));
    }

    #[test]
    fn test_parse_complete_error_document() {
        let body = r#"<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"#;
        assert!(matches!(
            parse_complete(body),
            Err(BrokerError::Remote { ref code, .. }) if code == "InternalError"
        ));
    }
}
