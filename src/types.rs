//! SAGE 核心数据类型
//!
//! 事件类型与事件载荷，供事件总线和模块之间传递

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 模块名称
pub type ModuleName = String;
/// 纳秒时间戳
pub type TimestampNs = i64;

/// 事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    // 语音
    VoiceCommand,
    VoiceTranscription,
    SpeakRequest,
    WakeWordDetected,
    // 视觉
    FaceDetected,
    ObjectDetected,
    ScreenCaptured,
    // 语言理解
    IntentParsed,
    LlmResponse,
    ContextUpdated,
    // 日程
    ReminderDue,
    ScheduleUpdated,
    // 系统
    ModuleLoaded,
    ModuleUnloaded,
    ErrorOccurred,
    ResourceWarning,
    HealthCheckFailed,
    ShutdownRequested,
    SystemShutdown,
    /// 自定义事件
    Custom(String),
}

impl EventType {
    /// 点分形式的事件名称
    pub fn as_str(&self) -> &str {
        match self {
            EventType::VoiceCommand => "voice.command",
            EventType::VoiceTranscription => "voice.transcription",
            EventType::SpeakRequest => "voice.speak",
            EventType::WakeWordDetected => "voice.wake_word",
            EventType::FaceDetected => "vision.face_detected",
            EventType::ObjectDetected => "vision.object_detected",
            EventType::ScreenCaptured => "vision.screen_captured",
            EventType::IntentParsed => "nlp.intent_parsed",
            EventType::LlmResponse => "nlp.llm_response",
            EventType::ContextUpdated => "nlp.context_updated",
            EventType::ReminderDue => "calendar.reminder_due",
            EventType::ScheduleUpdated => "calendar.schedule_updated",
            EventType::ModuleLoaded => "system.module_loaded",
            EventType::ModuleUnloaded => "system.module_unloaded",
            EventType::ErrorOccurred => "system.error",
            EventType::ResourceWarning => "system.resource_warning",
            EventType::HealthCheckFailed => "system.health_check_failed",
            EventType::ShutdownRequested => "system.shutdown",
            EventType::SystemShutdown => "system.shutdown_immediate",
            EventType::Custom(name) => name,
        }
    }

    /// 由点分名称解析，未知名称视为自定义事件
    pub fn from_name(name: &str) -> Self {
        match name {
            "voice.command" => EventType::VoiceCommand,
            "voice.transcription" => EventType::VoiceTranscription,
            "voice.speak" => EventType::SpeakRequest,
            "voice.wake_word" => EventType::WakeWordDetected,
            "vision.face_detected" => EventType::FaceDetected,
            "vision.object_detected" => EventType::ObjectDetected,
            "vision.screen_captured" => EventType::ScreenCaptured,
            "nlp.intent_parsed" => EventType::IntentParsed,
            "nlp.llm_response" => EventType::LlmResponse,
            "nlp.context_updated" => EventType::ContextUpdated,
            "calendar.reminder_due" => EventType::ReminderDue,
            "calendar.schedule_updated" => EventType::ScheduleUpdated,
            "system.module_loaded" => EventType::ModuleLoaded,
            "system.module_unloaded" => EventType::ModuleUnloaded,
            "system.error" => EventType::ErrorOccurred,
            "system.resource_warning" => EventType::ResourceWarning,
            "system.health_check_failed" => EventType::HealthCheckFailed,
            "system.shutdown" => EventType::ShutdownRequested,
            "system.shutdown_immediate" => EventType::SystemShutdown,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 默认事件优先级
pub const DEFAULT_EVENT_PRIORITY: u8 = 5;

/// 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// 事件ID
    pub id: uuid::Uuid,
    /// 事件类型
    pub event_type: EventType,
    /// 事件数据
    pub data: HashMap<String, serde_json::Value>,
    /// 来源模块
    pub source_module: Option<ModuleName>,
    /// 优先级 1-10，越大越重要
    pub priority: u8,
    /// 事件时间
    pub timestamp: TimestampNs,
}

impl Event {
    /// 创建新事件
    pub fn new(event_type: EventType, data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            event_type,
            data,
            source_module: None,
            priority: DEFAULT_EVENT_PRIORITY,
            timestamp: now_ns(),
        }
    }

    /// 设置来源模块
    pub fn with_source(mut self, module: &str) -> Self {
        self.source_module = Some(module.to_string());
        self
    }

    /// 设置优先级，超出范围时截断到 1-10
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    /// 模块加载完成事件
    pub fn module_loaded(module_name: &str, force_reload: bool) -> Self {
        let mut data = HashMap::new();
        data.insert("module_name".to_string(), serde_json::json!(module_name));
        data.insert("force_reload".to_string(), serde_json::json!(force_reload));
        Self::new(EventType::ModuleLoaded, data)
    }

    /// 模块卸载事件
    pub fn module_unloaded(module_name: &str) -> Self {
        let mut data = HashMap::new();
        data.insert("module_name".to_string(), serde_json::json!(module_name));
        Self::new(EventType::ModuleUnloaded, data)
    }

    /// 读取字符串字段
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// 当前时间（纳秒）
pub fn now_ns() -> TimestampNs {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::ModuleLoaded.as_str(), "system.module_loaded");
        assert_eq!(EventType::SystemShutdown.to_string(), "system.shutdown_immediate");
        assert_eq!(EventType::from_name("voice.speak"), EventType::SpeakRequest);
        assert_eq!(
            EventType::from_name("weather.update"),
            EventType::Custom("weather.update".to_string())
        );
    }

    #[test]
    fn test_module_loaded_payload() {
        let event = Event::module_loaded("calendar", true);
        assert_eq!(event.event_type, EventType::ModuleLoaded);
        assert_eq!(event.get_str("module_name"), Some("calendar"));
        assert_eq!(event.data.get("force_reload"), Some(&serde_json::json!(true)));
        assert_eq!(event.priority, DEFAULT_EVENT_PRIORITY);
    }

    #[test]
    fn test_priority_is_clamped() {
        let event = Event::module_unloaded("voice").with_priority(42);
        assert_eq!(event.priority, 10);
        let event = Event::module_unloaded("voice").with_priority(0);
        assert_eq!(event.priority, 1);
    }
}
