//! Multipart upload lifecycle: initiation, part staging with usage
//! deltas, abort, and listing.  Completion itself is a
//! [`Meta::put_object`] with the upload as the multipart source.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::client::ListUploadsResult;
use crate::errors::MetaError;
use crate::types::{Multipart, Part};

use super::Meta;

/// Characters percent-encoded when a listing asks for URL encoding.
/// Everything outside the unreserved set is escaped; `/` is kept so
/// encoded keys stay path-shaped.
const URL_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, URL_ENCODE_SET).to_string()
}

impl Meta {
    /// Register a new upload under its bucket and key.  No usage
    /// effect; bytes are counted part by part as they arrive.
    pub async fn create_multipart(&self, multipart: &Multipart) -> Result<(), MetaError> {
        self.client.create_multipart(multipart).await?;
        Ok(())
    }

    /// Fetch an upload together with its staged parts.
    pub async fn get_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Multipart, MetaError> {
        let multipart = self.client.get_multipart(bucket, key, upload_id).await?;
        multipart.ok_or_else(|| MetaError::NoSuchUpload {
            upload_id: upload_id.to_string(),
        })
    }

    /// Stage one part and settle its usage delta in the same
    /// transaction.  Re-uploading a part number replaces the previous
    /// part, so the delta is taken against the replaced size; the delta
    /// write is staged even when it is zero.
    pub async fn put_object_part(
        &self,
        multipart: &Multipart,
        part: &Part,
    ) -> Result<(), MetaError> {
        let replaced = multipart
            .parts
            .get(&part.part_number)
            .map_or(0, |p| p.size as i64);
        let delta = part.size as i64 - replaced;
        let mut tx = self.client.new_trans().await?;
        self.client
            .put_object_part(multipart, part, Some(&mut tx))
            .await?;
        self.client
            .update_usage(&multipart.bucket, delta, Some(&mut tx))
            .await?;
        self.client.commit_trans(tx).await?;
        Ok(())
    }

    /// Remove an upload and all its staged parts, returning the staged
    /// bytes to the usage counter.  This is the abort path.
    pub async fn delete_multipart(&self, multipart: &Multipart) -> Result<(), MetaError> {
        let mut tx = self.client.new_trans().await?;
        self.client
            .delete_multipart(multipart, Some(&mut tx))
            .await?;
        self.client
            .update_usage(
                &multipart.bucket,
                -(multipart.total_size() as i64),
                Some(&mut tx),
            )
            .await?;
        self.client.commit_trans(tx).await?;
        Ok(())
    }

    /// List in-progress uploads ordered by `(key, upload id)`, with
    /// prefix/delimiter grouping and marker-driven pagination.
    /// `encoding_type == "url"` percent-encodes the keys, prefixes, and
    /// key marker of the result.
    #[allow(clippy::too_many_arguments)]
    pub async fn list_multipart_uploads(
        &self,
        bucket: &str,
        key_marker: &str,
        upload_id_marker: &str,
        prefix: &str,
        delimiter: &str,
        encoding_type: &str,
        max_uploads: u32,
    ) -> Result<ListUploadsResult, MetaError> {
        let mut result = self
            .client
            .list_multipart_uploads(
                bucket,
                prefix,
                delimiter,
                key_marker,
                upload_id_marker,
                max_uploads,
            )
            .await?;
        if encoding_type == "url" {
            for upload in &mut result.uploads {
                upload.key = url_encode(&upload.key);
            }
            for common_prefix in &mut result.common_prefixes {
                *common_prefix = url_encode(common_prefix);
            }
            if let Some(marker) = &mut result.next_key_marker {
                *marker = url_encode(marker);
            }
        }
        Ok(result)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
