//! OCI image support.
//!
//! ```text
//! <image>/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>
//!     └── <layers>
//! ```

pub(crate) mod image;
mod layers;
mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use image::{blob_path, HistoryEntry, ImageLayer, OciImage, OciImageConfig};
pub use layers::extract_layer;
pub use pull::{BaseImageSource, ImagePuller, LocalImageSource};
pub use reference::{ImageReference, SCRATCH};
pub use registry::{RegistryAuth, RegistryPuller};
pub use store::{ImageStore, StoredImage};
