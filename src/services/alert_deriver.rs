//! Severity classification for detections and the alerts they raise.
//!
//! One rule set decides both `Detection.severity_level` / `requires_action` and whether an
//! alert is raised at what priority:
//!
//! * `fire` and `pipeline_damage` are always critical.
//! * Confidence above 0.90 lifts anything to at least high.
//! * `pest_infestation` and `animal_intrusion` are at least medium.
//! * Everything else is low.
//!
//! Action is required for high and critical findings and for the hazard types
//! (fire, pipeline damage, animal intrusion). Low findings that need no action and have
//! confidence at or below 0.65 raise nothing.

use crate::db::models::{
    Alert, AlertStatus, Detection, DetectionType, RawDetection, Severity, Video,
};
use chrono::Utc;
use log::debug;
use uuid::Uuid;

const HIGH_CONFIDENCE: f64 = 0.90;
const ALERT_CONFIDENCE_FLOOR: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub severity: Severity,
    pub requires_action: bool,
}

pub fn classify(detection_type: &DetectionType, confidence: f64) -> Classification {
    let floor = match detection_type {
        DetectionType::Fire | DetectionType::PipelineDamage => Severity::Critical,
        DetectionType::PestInfestation | DetectionType::AnimalIntrusion => Severity::Medium,
        _ => Severity::Low,
    };

    let severity = if confidence > HIGH_CONFIDENCE {
        floor.max(Severity::High)
    } else {
        floor
    };

    let hazard = matches!(
        detection_type,
        DetectionType::Fire | DetectionType::PipelineDamage | DetectionType::AnimalIntrusion
    );

    Classification {
        severity,
        requires_action: severity >= Severity::High || hazard,
    }
}

/// Turn a detector tuple into a classified detection.
///
/// Tuples with a non-finite confidence are dropped; other confidences are clamped to 0..=1.
pub fn build_detection(video_id: Uuid, raw: &RawDetection) -> Option<Detection> {
    if !raw.confidence.is_finite() {
        debug!(
            "Dropping {} detection with confidence {}",
            raw.detection_type, raw.confidence
        );
        return None;
    }

    let confidence = raw.confidence.clamp(0.0, 1.0);
    let detection_type = DetectionType::parse(&raw.detection_type);
    let class = classify(&detection_type, confidence);
    let timestamp = raw.timestamp_seconds.filter(|t| t.is_finite() && *t >= 0.0);

    let mut description = format!(
        "{} detected with {:.0}% confidence",
        detection_type.label(),
        confidence * 100.0
    );
    if let Some(at) = timestamp {
        description.push_str(&format!(" at {:.1}s", at));
    }

    Some(Detection {
        id: Uuid::new_v4(),
        video_id,
        detection_type,
        confidence_score: confidence,
        timestamp_in_video: timestamp,
        severity_level: class.severity,
        requires_action: class.requires_action,
        description,
        bounding_box: raw.bbox,
        created_at: Utc::now(),
    })
}

/// Derive the alert a detection raises, if any
pub fn derive(detection: &Detection, video: &Video) -> Option<Alert> {
    let class = classify(&detection.detection_type, detection.confidence_score);

    if class.severity == Severity::Low
        && !class.requires_action
        && detection.confidence_score <= ALERT_CONFIDENCE_FLOOR
    {
        return None;
    }

    let label = detection.detection_type.label();
    let mut message = format!(
        "{} detected with {:.0}% confidence",
        label,
        detection.confidence_score * 100.0
    );
    if let Some(sector) = &video.field_sector {
        message.push_str(&format!(" in sector {}", sector));
    }
    if let Some(at) = detection.timestamp_in_video {
        message.push_str(&format!(" ({:.1}s into {})", at, video.filename));
    }

    let now = Utc::now();
    Some(Alert {
        id: Uuid::new_v4(),
        detection_id: Some(detection.id),
        video_id: Some(video.id),
        alert_type: detection.detection_type.as_str().to_string(),
        priority_level: class.severity,
        title: format!("{} detected", label),
        message,
        status: AlertStatus::Active,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
        resolved_by: None,
        resolution_notes: None,
        gps_location: video.gps,
        action_required: Some(action_for(&detection.detection_type).to_string()),
        created_at: now,
        updated_at: now,
    })
}

fn action_for(detection_type: &DetectionType) -> &'static str {
    match detection_type {
        DetectionType::Fire => "Dispatch fire response to the reported location immediately",
        DetectionType::PipelineDamage => {
            "Shut off the affected pipeline section and send a repair crew"
        }
        DetectionType::AnimalIntrusion => "Send a patrol to secure the perimeter",
        DetectionType::PestInfestation => "Schedule a crop inspection and pest treatment",
        DetectionType::Person => "Verify whether the person is authorised to be on site",
        DetectionType::Vehicle => "Verify whether the vehicle is authorised to be on site",
        DetectionType::Other(_) => "Review the footage and decide on follow-up",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GpsCoordinates, VideoMetadata};

    fn video() -> Video {
        Video::new_pending(
            Uuid::new_v4(),
            "north.mp4",
            1024,
            "video/mp4",
            "file:///tmp/north.mp4".to_string(),
            VideoMetadata {
                gps: Some(GpsCoordinates {
                    latitude: 52.1,
                    longitude: 5.3,
                }),
                field_sector: Some("N-4".to_string()),
                weather_conditions: None,
            },
        )
    }

    fn detection(tag: &str, confidence: f64) -> Detection {
        build_detection(Uuid::new_v4(), &RawDetection::new(tag, confidence)).unwrap()
    }

    #[test]
    fn severity_table() {
        let cases = [
            ("fire", 0.5, Severity::Critical, true),
            ("pipeline_damage", 0.2, Severity::Critical, true),
            ("animal_intrusion", 0.7, Severity::Medium, true),
            ("pest_infestation", 0.7, Severity::Medium, false),
            ("pest_infestation", 0.95, Severity::High, true),
            ("person", 0.3, Severity::Low, false),
            ("vehicle", 0.91, Severity::High, true),
            ("vehicle", 0.90, Severity::Low, false),
        ];

        for (tag, confidence, severity, requires_action) in cases {
            let class = classify(&DetectionType::parse(tag), confidence);
            assert_eq!(class.severity, severity, "{} at {}", tag, confidence);
            assert_eq!(class.requires_action, requires_action, "{} at {}", tag, confidence);
        }
    }

    #[test]
    fn low_confidence_person_raises_nothing() {
        assert!(derive(&detection("person", 0.3), &video()).is_none());
        assert!(derive(&detection("person", 0.65), &video()).is_none());
        // Above the floor a low finding still raises a low alert
        let alert = derive(&detection("person", 0.7), &video()).unwrap();
        assert_eq!(alert.priority_level, Severity::Low);
    }

    #[test]
    fn fire_raises_critical_alert_with_video_context() {
        let video = video();
        let detection = build_detection(video.id, &RawDetection::new("Fire", 0.5)).unwrap();
        let alert = derive(&detection, &video).unwrap();

        assert_eq!(alert.priority_level, Severity::Critical);
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.alert_type, "fire");
        assert_eq!(alert.title, "Fire detected");
        assert!(alert.message.contains("50%"));
        assert!(alert.message.contains("N-4"));
        assert_eq!(alert.detection_id, Some(detection.id));
        assert_eq!(alert.video_id, Some(video.id));
        assert_eq!(alert.gps_location, video.gps);
        assert!(alert.action_required.is_some());
    }

    #[test]
    fn tags_are_normalised() {
        let detection = detection("Pipeline-Damage", 0.4);
        assert_eq!(detection.detection_type, DetectionType::PipelineDamage);
        assert_eq!(detection.severity_level, Severity::Critical);
    }

    #[test]
    fn confidences_are_sanitised() {
        let video_id = Uuid::new_v4();
        assert!(build_detection(video_id, &RawDetection::new("fire", f64::NAN)).is_none());
        assert!(build_detection(video_id, &RawDetection::new("fire", f64::INFINITY)).is_none());

        let high = build_detection(video_id, &RawDetection::new("vehicle", 1.7)).unwrap();
        assert_eq!(high.confidence_score, 1.0);
        let low = build_detection(video_id, &RawDetection::new("vehicle", -0.2)).unwrap();
        assert_eq!(low.confidence_score, 0.0);
    }
}
