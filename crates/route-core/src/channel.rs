use serde::{Deserialize, Serialize};

/// One named channel of a request or result batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<f64>,
    #[serde(default, with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
}

impl Channel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Copy times, payload and type from another channel, keeping this name.
    pub fn copy_payload_from(&mut self, other: &Channel) {
        self.times.clone_from(&other.times);
        self.data.clone_from(&other.data);
        self.mime.clone_from(&other.mime);
    }

    pub fn has_payload(&self) -> bool {
        !self.data.is_empty() || !self.times.is_empty()
    }
}

/// Ordered set of channels plus a set of folder names.
///
/// Channel names are unique within a map; `add` returns the existing index
/// when a name is already present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMap {
    #[serde(default)]
    channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    folders: Vec<String>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map holding the given channel names with no payload.
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut map = Self::new();
        for name in names {
            map.add(name);
        }
        map
    }

    pub fn add(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        if let Some(idx) = self.index_of(&name) {
            return idx;
        }
        self.channels.push(Channel::named(name));
        self.channels.len() - 1
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    pub fn add_folder(&mut self, folder: impl Into<String>) {
        let folder = folder.into();
        if !self.folders.contains(&folder) {
            self.folders.push(folder);
        }
    }

    pub fn channel(&self, idx: usize) -> Option<&Channel> {
        self.channels.get(idx)
    }

    pub fn channel_mut(&mut self, idx: usize) -> Option<&mut Channel> {
        self.channels.get_mut(idx)
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    pub fn first_name(&self) -> Option<&str> {
        self.channels.first().map(|c| c.name.as_str())
    }

    pub fn put_data(&mut self, idx: usize, data: Vec<u8>, mime: Option<&str>) {
        if let Some(channel) = self.channels.get_mut(idx) {
            channel.data = data;
            channel.mime = mime.map(str::to_string);
        }
    }

    pub fn put_string(&mut self, idx: usize, value: &str) {
        self.put_data(idx, value.as_bytes().to_vec(), Some("text/plain"));
    }

    pub fn put_times(&mut self, idx: usize, times: Vec<f64>) {
        if let Some(channel) = self.channels.get_mut(idx) {
            channel.times = times;
        }
    }

    /// Payload of a channel decoded as UTF-8, if it is valid text.
    pub fn data_as_str(&self, idx: usize) -> Option<&str> {
        self.channels
            .get(idx)
            .and_then(|c| std::str::from_utf8(&c.data).ok())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// True when the map holds neither channels nor folders.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.folders.is_empty()
    }

    /// Approximate size of the carried payload (data bytes plus 8 per timestamp).
    pub fn payload_bytes(&self) -> u64 {
        self.channels
            .iter()
            .map(|c| c.data.len() as u64 + 8 * c.times.len() as u64)
            .sum()
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.folders.clear();
    }
}

/// Base64 (standard alphabet) encoding of payload bytes in JSON.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
