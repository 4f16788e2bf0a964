// Codec registry: built-in codecs by wire id, user codecs by name

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use courier_common::BusError;

use super::{Body, MessageCodec, SystemCodec, USER_CODEC_ID};

/// Codecs known to one bus instance
pub struct CodecRegistry {
    system: Vec<Arc<dyn MessageCodec>>,
    user: DashMap<String, Arc<dyn MessageCodec>>,
    defaults: DashMap<TypeId, Arc<dyn MessageCodec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        let system = SystemCodec::ALL
            .iter()
            .map(|codec| Arc::new(*codec) as Arc<dyn MessageCodec>)
            .collect();
        Self {
            system,
            user: DashMap::new(),
            defaults: DashMap::new(),
        }
    }

    /// Register a user codec under its name
    pub fn register(&self, codec: Arc<dyn MessageCodec>) -> Result<(), BusError> {
        let name = codec.name().to_string();
        if name.is_empty() {
            return Err(BusError::IllegalArgument(
                "codec name must not be empty".to_string(),
            ));
        }
        if codec.system_id() != USER_CODEC_ID {
            return Err(BusError::IllegalArgument(format!(
                "codec '{name}' claims system id {}, only built-in codecs may",
                codec.system_id()
            )));
        }
        if SystemCodec::ALL.iter().any(|c| c.as_str() == name) {
            return Err(BusError::CodecAlreadyRegistered(name));
        }

        match self.user.entry(name.clone()) {
            Entry::Occupied(_) => Err(BusError::CodecAlreadyRegistered(name)),
            Entry::Vacant(entry) => {
                entry.insert(codec);
                info!(codec = %name, "Registered message codec '{}'", name);
                Ok(())
            }
        }
    }

    /// Register a user codec and make it the codec used for bodies of type `T`
    /// when a send does not name one.
    pub fn register_default<T: Any>(&self, codec: Arc<dyn MessageCodec>) -> Result<(), BusError> {
        match self.defaults.entry(TypeId::of::<T>()) {
            Entry::Occupied(_) => Err(BusError::IllegalState(format!(
                "a default codec is already registered for {}",
                std::any::type_name::<T>()
            ))),
            Entry::Vacant(entry) => {
                self.register(codec.clone())?;
                entry.insert(codec);
                Ok(())
            }
        }
    }

    /// Unregister a user codec by name
    pub fn unregister(&self, name: &str) -> Result<(), BusError> {
        match self.user.remove(name) {
            Some(_) => {
                self.defaults.retain(|_, codec| codec.name() != name);
                info!(codec = %name, "Unregistered message codec '{}'", name);
                Ok(())
            }
            None => {
                warn!(
                    codec = %name,
                    "Attempted to unregister non-existent codec '{}'", name
                );
                Err(BusError::CodecNotFound(name.to_string()))
            }
        }
    }

    /// Unregister the default codec of type `T`
    pub fn unregister_default<T: Any>(&self) -> Result<(), BusError> {
        let (_, codec) = self
            .defaults
            .remove(&TypeId::of::<T>())
            .ok_or_else(|| BusError::CodecNotFound(std::any::type_name::<T>().to_string()))?;
        self.unregister(codec.name())
    }

    /// Resolve the codec used to send `body`.
    ///
    /// An explicit name must match a registered user codec. Without one, built-in
    /// bodies use their system codec and application objects their type's default.
    pub fn lookup_for_send(
        &self,
        body: &Body,
        codec_name: Option<&str>,
    ) -> Result<Arc<dyn MessageCodec>, BusError> {
        if let Some(name) = codec_name {
            return self
                .user_codec(name)
                .ok_or_else(|| BusError::CodecNotFound(name.to_string()));
        }

        match body {
            Body::Object(object) => self
                .defaults
                .get(&object.value_type_id())
                .map(|codec| codec.value().clone())
                .ok_or_else(|| BusError::UnencodableType(object.type_name().to_string())),
            other => SystemCodec::for_body(other)
                .and_then(|codec| self.system_codec(codec as i8))
                .ok_or_else(|| BusError::UnencodableType(other.type_name().to_string())),
        }
    }

    pub fn system_codec(&self, id: i8) -> Option<Arc<dyn MessageCodec>> {
        usize::try_from(id)
            .ok()
            .and_then(|index| self.system.get(index))
            .cloned()
    }

    pub fn user_codec(&self, name: &str) -> Option<Arc<dyn MessageCodec>> {
        self.user.get(name).map(|codec| codec.value().clone())
    }

    /// Names of all registered user codecs
    pub fn user_codec_names(&self) -> Vec<String> {
        self.user.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every user codec; built-ins stay.
    pub fn clear(&self) {
        let count = self.user.len();
        self.defaults.clear();
        self.user.clear();
        debug!(count, "Cleared user codecs");
    }
}
