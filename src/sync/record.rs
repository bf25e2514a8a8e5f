//! Object record model for shared spatial windows.
//!
//! A "window" is a uniquely-identified spatial record: a closed kind tag, an
//! opaque content/data payload owned by the rendering collaborator for that
//! kind, a position and an optional rotation. Mutations travel as partial
//! patches with explicit field presence, so an empty-string content update is
//! a real overwrite rather than being skipped.

use serde::{Deserialize, Serialize};

use super::ObjectId;

/// Serde adapter for the opaque `data`/`payload` fields.
///
/// `serde_json::Value` deserializes via `deserialize_any`, which bincode
/// cannot service, so the binary framing and the sled archive carry these
/// fields as pre-serialized JSON strings. Human-readable formats (the JSON
/// text fallback) keep the plain value.
pub(crate) mod opaque_json {
    use serde::de::Error as DeError;
    use serde::ser::Error as SerError;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            return value.serialize(serializer);
        }
        match value {
            Some(v) => {
                let text = serde_json::to_string(v).map_err(S::Error::custom)?;
                serializer.serialize_some(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            return Option::<Value>::deserialize(deserializer);
        }
        let text = Option::<String>::deserialize(deserializer)?;
        text.map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(D::Error::custom)
    }
}

/// A 3-component vector used for positions and rotations.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Closed set of object kinds. The tag selects which rendering collaborator
/// owns the object's `content`/`data` semantics; the sync core never
/// interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    #[serde(rename = "TERMINAL")]
    Terminal,
    #[serde(rename = "DOC")]
    Doc,
    #[serde(rename = "IMAGE")]
    Image,
    #[serde(rename = "VIDEO")]
    Video,
    #[serde(rename = "YOUTUBE")]
    Youtube,
    #[serde(rename = "MUSIC")]
    Music,
    #[serde(rename = "BROWSER")]
    Browser,
    #[serde(rename = "WIDGET_TIMER")]
    WidgetTimer,
    #[serde(rename = "WIDGET_STOCK")]
    WidgetStock,
    #[serde(rename = "WIDGET_NOTES")]
    WidgetNotes,
    #[serde(rename = "WIDGET_BROWSER")]
    WidgetBrowser,
    #[serde(rename = "WIDGET_CALCULATOR")]
    WidgetCalculator,
    #[serde(rename = "WIDGET_CLOCK")]
    WidgetClock,
    #[serde(rename = "WIDGET_WEATHER")]
    WidgetWeather,
    #[serde(rename = "WIDGET_REMINDERS")]
    WidgetReminders,
    #[serde(rename = "WIDGET_WALLET")]
    WidgetWallet,
}

impl ObjectKind {
    /// Kinds that embed a playable track and carry `media_state`.
    pub fn is_media(&self) -> bool {
        matches!(self, ObjectKind::Youtube | ObjectKind::Music | ObjectKind::Video)
    }

    /// Small utility widgets.
    pub fn is_widget(&self) -> bool {
        matches!(
            self,
            ObjectKind::WidgetTimer
                | ObjectKind::WidgetStock
                | ObjectKind::WidgetNotes
                | ObjectKind::WidgetBrowser
                | ObjectKind::WidgetCalculator
                | ObjectKind::WidgetClock
                | ObjectKind::WidgetWeather
                | ObjectKind::WidgetReminders
                | ObjectKind::WidgetWallet
        )
    }

    /// Wire tag, also used as the id prefix for generated objects.
    pub fn tag(&self) -> &'static str {
        match self {
            ObjectKind::Terminal => "TERMINAL",
            ObjectKind::Doc => "DOC",
            ObjectKind::Image => "IMAGE",
            ObjectKind::Video => "VIDEO",
            ObjectKind::Youtube => "YOUTUBE",
            ObjectKind::Music => "MUSIC",
            ObjectKind::Browser => "BROWSER",
            ObjectKind::WidgetTimer => "WIDGET_TIMER",
            ObjectKind::WidgetStock => "WIDGET_STOCK",
            ObjectKind::WidgetNotes => "WIDGET_NOTES",
            ObjectKind::WidgetBrowser => "WIDGET_BROWSER",
            ObjectKind::WidgetCalculator => "WIDGET_CALCULATOR",
            ObjectKind::WidgetClock => "WIDGET_CLOCK",
            ObjectKind::WidgetWeather => "WIDGET_WEATHER",
            ObjectKind::WidgetReminders => "WIDGET_REMINDERS",
            ObjectKind::WidgetWallet => "WIDGET_WALLET",
        }
    }
}

/// Last media-control action applied to a media-capable object, replicated so
/// late joiners converge on play/pause/seek/volume/queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub action: String,
    #[serde(default, with = "opaque_json")]
    pub payload: Option<serde_json::Value>,
}

/// The full authoritative record for one live object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Opaque unique key within the session.
    pub id: ObjectId,
    pub kind: ObjectKind,
    /// Opaque string payload (URL, raw text); semantics owned by the kind.
    pub content: Option<String>,
    /// Opaque structured payload; same ownership rule as `content`.
    #[serde(default, with = "opaque_json")]
    pub data: Option<serde_json::Value>,
    pub position: Vec3,
    /// Present only when explicitly set (e.g. on restore from the archive).
    pub rotation: Option<Vec3>,
    /// Transient media sub-record, attached by `media-action` messages.
    pub media_state: Option<MediaState>,
}

impl ObjectRecord {
    pub fn new(id: impl Into<String>, kind: ObjectKind, position: Vec3) -> Self {
        Self {
            id: id.into(),
            kind,
            content: None,
            data: None,
            position,
            rotation: None,
            media_state: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Merge a partial update onto this record, field by field. Only supplied
    /// fields overwrite; absent fields are left untouched. A supplied empty
    /// content string is a real overwrite.
    pub fn apply(&mut self, patch: &ObjectPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = Some(rotation);
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(content) = &patch.content {
            self.content = Some(content.clone());
        }
        if let Some(data) = &patch.data {
            self.data = Some(data.clone());
        }
    }

    /// Build a fresh record from a patch. Requires `kind` and `position`;
    /// returns `None` otherwise (a move for an id that was never spawned).
    pub fn from_patch(patch: &ObjectPatch) -> Option<Self> {
        let kind = patch.kind?;
        let position = patch.position?;
        Some(Self {
            id: patch.id.clone(),
            kind,
            content: patch.content.clone(),
            data: patch.data.clone(),
            position,
            rotation: patch.rotation,
            media_state: None,
        })
    }

    /// Capture an archive entry sufficient to exactly respawn this object.
    pub fn to_archive_entry(&self) -> ArchiveEntry {
        ArchiveEntry {
            id: self.id.clone(),
            kind: self.kind,
            content: self.content.clone(),
            data: self.data.clone(),
            position: self.position,
            rotation: self.rotation,
        }
    }
}

/// Partial mutation for one object. Every optional field carries an explicit
/// presence flag on the wire (the `Option` tag itself), so receivers never
/// have to guess whether a field was omitted or deliberately cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub id: ObjectId,
    pub position: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub kind: Option<ObjectKind>,
    pub content: Option<String>,
    #[serde(default, with = "opaque_json")]
    pub data: Option<serde_json::Value>,
}

impl ObjectPatch {
    /// A bare positional move.
    pub fn movement(id: impl Into<String>, position: Vec3) -> Self {
        Self {
            id: id.into(),
            position: Some(position),
            rotation: None,
            kind: None,
            content: None,
            data: None,
        }
    }

    /// A full spawn patch.
    pub fn spawn(id: impl Into<String>, kind: ObjectKind, position: Vec3) -> Self {
        Self {
            id: id.into(),
            position: Some(position),
            rotation: None,
            kind: Some(kind),
            content: None,
            data: None,
        }
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Everything needed to respawn a record from scratch.
    pub fn from_record(record: &ObjectRecord) -> Self {
        Self {
            id: record.id.clone(),
            position: Some(record.position),
            rotation: record.rotation,
            kind: Some(record.kind),
            content: record.content.clone(),
            data: record.data.clone(),
        }
    }
}

/// A full point-in-time copy of a former live object, held in the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub content: Option<String>,
    #[serde(default, with = "opaque_json")]
    pub data: Option<serde_json::Value>,
    pub position: Vec3,
    pub rotation: Option<Vec3>,
}

impl ArchiveEntry {
    /// The spawn patch that re-creates the live object from this entry.
    pub fn to_spawn_patch(&self) -> ObjectPatch {
        ObjectPatch {
            id: self.id.clone(),
            position: Some(self.position),
            rotation: self.rotation,
            kind: Some(self.kind),
            content: self.content.clone(),
            data: self.data.clone(),
        }
    }
}

/// Generate an object id in the `<prefix>_<millis>_<rand>` convention. The
/// core treats the result as an opaque key; the convention only makes
/// accidental collision practically impossible.
pub fn generate_object_id(prefix: &str) -> ObjectId {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!(
        "{}_{}_{}",
        prefix,
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_merges_only_supplied_fields() {
        let mut record = ObjectRecord::new("win-1", ObjectKind::Terminal, Vec3::new(0.0, 2.0, 0.0))
            .with_content("hello");

        let patch = ObjectPatch::movement("win-1", Vec3::new(1.0, 2.0, 3.0));
        record.apply(&patch);

        assert_eq!(record.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(record.content.as_deref(), Some("hello"));
        assert_eq!(record.kind, ObjectKind::Terminal);
    }

    #[test]
    fn test_apply_empty_content_overwrites() {
        let mut record = ObjectRecord::new("win-1", ObjectKind::Browser, Vec3::default())
            .with_content("https://example.com");

        let patch = ObjectPatch::movement("win-1", Vec3::default()).with_content("");
        record.apply(&patch);

        assert_eq!(record.content.as_deref(), Some(""));
    }

    #[test]
    fn test_from_patch_requires_kind_and_position() {
        let bare_move = ObjectPatch::movement("win-9", Vec3::default());
        assert!(ObjectRecord::from_patch(&bare_move).is_none());

        let spawn = ObjectPatch::spawn("win-9", ObjectKind::Doc, Vec3::new(0.0, 2.0, 0.0))
            .with_content("notes");
        let record = ObjectRecord::from_patch(&spawn).unwrap();
        assert_eq!(record.id, "win-9");
        assert_eq!(record.kind, ObjectKind::Doc);
        assert_eq!(record.content.as_deref(), Some("notes"));
        assert!(record.media_state.is_none());
    }

    #[test]
    fn test_archive_round_trip() {
        let record = ObjectRecord::new("yt-1", ObjectKind::Youtube, Vec3::new(1.0, 2.0, 0.0))
            .with_data(serde_json::json!({ "videoId": "abc123" }))
            .with_rotation(Vec3::new(0.0, 0.5, 0.0));

        let entry = record.to_archive_entry();
        let respawned = ObjectRecord::from_patch(&entry.to_spawn_patch()).unwrap();

        assert_eq!(respawned.id, record.id);
        assert_eq!(respawned.kind, record.kind);
        assert_eq!(respawned.data, record.data);
        assert_eq!(respawned.position, record.position);
        assert_eq!(respawned.rotation, record.rotation);
    }

    #[test]
    fn test_opaque_payloads_survive_bincode() {
        // The binary codec cannot drive serde_json::Value's self-describing
        // deserializer, so data/payload travel as pre-serialized JSON text.
        let mut record = ObjectRecord::new("yt-1", ObjectKind::Youtube, Vec3::default())
            .with_data(serde_json::json!({ "videoId": "dQw4w9WgXcQ", "t": 42 }));
        record.media_state = Some(MediaState {
            action: "seek".to_string(),
            payload: Some(serde_json::json!({ "seconds": 90 })),
        });

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: ObjectRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, record);

        let entry = record.to_archive_entry();
        let bytes = bincode::serialize(&entry).unwrap();
        let decoded: ArchiveEntry = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_opaque_payloads_stay_plain_in_json() {
        let record = ObjectRecord::new("yt-1", ObjectKind::Youtube, Vec3::default())
            .with_data(serde_json::json!({ "videoId": "abc" }));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["data"]["videoId"], "abc");

        let back: ObjectRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(ObjectKind::WidgetTimer.tag(), "WIDGET_TIMER");
        assert!(ObjectKind::Music.is_media());
        assert!(!ObjectKind::Terminal.is_media());
        assert!(ObjectKind::WidgetClock.is_widget());

        let json = serde_json::to_string(&ObjectKind::Youtube).unwrap();
        assert_eq!(json, "\"YOUTUBE\"");
    }

    #[test]
    fn test_generate_object_id_shape() {
        let id = generate_object_id("DOC");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "DOC");
        assert!(parts[1].parse::<i64>().is_ok());
    }
}
