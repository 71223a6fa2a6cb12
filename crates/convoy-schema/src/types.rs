//! Newtype wrappers for string identifiers.
//!
//! Every identifier serializes as a plain string so stored rows and fleet
//! files stay readable.

use crate::device::WatcherKind;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Stable identifier of a managed device, issued by the device service.
    DeviceUuid
);

string_newtype!(
    /// Identifier of a persisted container row. Issued by reconciliation.
    ContainerUuid
);

string_newtype!(
    /// Runtime-native identifier: a Docker container id or a Proxmox vmid.
    ProviderId
);

string_newtype!(
    /// Name of one watcher on one device, e.g. `docker-6f1c...`.
    WatcherName
);

string_newtype!(
    /// Engine registry key, `{device_uuid}:{watcher_name}`.
    WatcherKey
);

impl ContainerUuid {
    /// Fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl WatcherName {
    pub fn for_device(kind: WatcherKind, device: &DeviceUuid) -> Self {
        Self(format!("{kind}-{device}"))
    }
}

impl WatcherKey {
    pub fn for_watcher(device: &DeviceUuid, watcher: &WatcherName) -> Self {
        Self(format!("{device}:{watcher}"))
    }

    /// Split into device uuid and watcher name.
    pub fn parts(&self) -> Result<(DeviceUuid, WatcherName), SchemaError> {
        match self.0.split_once(':') {
            Some((device, watcher)) if !device.is_empty() && !watcher.is_empty() => {
                Ok((DeviceUuid::new(device), WatcherName::new(watcher)))
            }
            _ => Err(SchemaError::InvalidKey(self.0.clone())),
        }
    }
}
