//! OCI source resolver: digest resolution, metadata-only lookup, lazy
//! payload fetch, and the content-addressed local cache.

pub mod cas;
pub mod error;
pub mod http;
pub mod metadata;
pub mod policy;
pub mod resolver;
pub mod testing;
pub mod transport;
pub mod uri;

pub use error::{OciError, Result};
pub use http::{HttpRegistry, OciClientConfig, DEFAULT_OCI_TIMEOUT};
pub use metadata::{
    parse_metadata_blob, PacketDescriptor, PacketMetadata, PayloadDescriptor, PayloadFile,
    LEGACY_SCHEMA, PACKET_METADATA_MEDIA_TYPE, PACKET_METADATA_SCHEMA,
    PACKET_METADATA_SCHEMA_VERSION,
};
pub use policy::{is_loopback, redact_token, safe_extract_path, OciPolicy};
pub use resolver::{LocalPacketDir, ResolvedLookup, SourceResolver, DEFAULT_ALIAS_TTL};
pub use transport::{
    Descriptor, ImageManifest, Registry, LAYER_TAR_GZ_MEDIA_TYPE, LAYER_TITLE_ANNOTATION,
    OCI_MANIFEST_MEDIA_TYPE,
};
pub use uri::{is_valid_digest, OciRef, Reference, OCI_SCHEME};
