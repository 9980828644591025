//! Named simulation scenarios.
//!
//! Each scenario is a fixed parameter set: initial vehicles around a
//! single intersection, plus whether a traffic light governs it. The
//! identifiers are part of the external contract and must not change.

use crossway_core::message::Intent;
use crossway_core::vehicle::BehaviorProfile;

/// Scenario identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Three vehicles converging on an uncontrolled intersection.
    RightOfWay,

    /// Four vehicles from all directions, no light.
    MultiVehicle,

    /// Four vehicles from all directions, light-controlled.
    MultiVehicleTrafficLight,

    /// Two perpendicular vehicles with no visibility of each other except
    /// through V2X.
    BlindIntersection,

    /// Ambulance crossing against a normal vehicle, light-controlled.
    EmergencyVehicle,

    /// Same, without a traffic light.
    EmergencyVehicleNoLights,

    /// One impaired vehicle against a compliant one.
    DrunkDriver,
}

impl ScenarioId {
    /// Returns all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::RightOfWay,
            ScenarioId::MultiVehicle,
            ScenarioId::MultiVehicleTrafficLight,
            ScenarioId::BlindIntersection,
            ScenarioId::EmergencyVehicle,
            ScenarioId::EmergencyVehicleNoLights,
            ScenarioId::DrunkDriver,
        ]
    }

    /// The stable wire name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::RightOfWay => "right_of_way",
            ScenarioId::MultiVehicle => "multi_vehicle",
            ScenarioId::MultiVehicleTrafficLight => "multi_vehicle_traffic_light",
            ScenarioId::BlindIntersection => "blind_intersection",
            ScenarioId::EmergencyVehicle => "emergency_vehicle",
            ScenarioId::EmergencyVehicleNoLights => "emergency_vehicle_no_lights",
            ScenarioId::DrunkDriver => "drunk_driver",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::RightOfWay => "3 vehicles, uncontrolled, right-hand priority",
            ScenarioId::MultiVehicle => "4 vehicles, uncontrolled",
            ScenarioId::MultiVehicleTrafficLight => "4 vehicles with adaptive light",
            ScenarioId::BlindIntersection => "2 perpendicular vehicles, V2X-only visibility",
            ScenarioId::EmergencyVehicle => "ambulance preempts a controlled intersection",
            ScenarioId::EmergencyVehicleNoLights => "ambulance crosses an uncontrolled intersection",
            ScenarioId::DrunkDriver => "impaired adversary among compliant traffic",
        }
    }

    /// Whether a traffic light governs the demo intersection.
    pub fn uses_light(&self) -> bool {
        matches!(
            self,
            ScenarioId::MultiVehicleTrafficLight | ScenarioId::EmergencyVehicle
        )
    }

    /// Initial vehicle set, positioned on right-hand lanes around the
    /// origin intersection.
    pub fn blueprints(&self, lane: f64) -> Vec<VehicleBlueprint> {
        match self {
            ScenarioId::RightOfWay => vec![
                VehicleBlueprint::normal("VH_N", -lane, 120.0, 180.0, 18.0),
                VehicleBlueprint::normal("VH_E", 120.0, lane, 270.0, 18.0),
                VehicleBlueprint::normal("VH_S", lane, -120.0, 0.0, 18.0),
            ],
            ScenarioId::MultiVehicle | ScenarioId::MultiVehicleTrafficLight => vec![
                VehicleBlueprint::normal("VH_N", -lane, 120.0, 180.0, 18.0),
                VehicleBlueprint::normal("VH_S", lane, -120.0, 0.0, 16.2),
                VehicleBlueprint::normal("VH_E", 120.0, lane, 270.0, 19.8),
                VehicleBlueprint::normal("VH_W", -120.0, -lane, 90.0, 14.4),
            ],
            ScenarioId::BlindIntersection => vec![
                VehicleBlueprint::normal("VH_A", lane, -80.0, 0.0, 10.0),
                VehicleBlueprint::normal("VH_B", -80.0, -lane, 90.0, 10.0),
            ],
            ScenarioId::EmergencyVehicle | ScenarioId::EmergencyVehicleNoLights => vec![
                VehicleBlueprint {
                    id: "AMBULANCE",
                    x: -120.0,
                    y: -lane,
                    heading: 90.0,
                    speed: 25.2,
                    target_speed: 25.2,
                    intent: Intent::Through,
                    profile: BehaviorProfile::Emergency,
                },
                VehicleBlueprint::normal("VH_C", lane, -120.0, 0.0, 18.0),
            ],
            ScenarioId::DrunkDriver => vec![
                VehicleBlueprint::normal("VH_A", -lane, 120.0, 180.0, 18.0),
                VehicleBlueprint {
                    id: "DRUNK",
                    x: 120.0,
                    y: lane,
                    heading: 270.0,
                    speed: 14.0,
                    target_speed: 14.0,
                    intent: Intent::Through,
                    profile: BehaviorProfile::Drunk,
                },
            ],
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "right_of_way" => Ok(ScenarioId::RightOfWay),
            "multi_vehicle" => Ok(ScenarioId::MultiVehicle),
            "multi_vehicle_traffic_light" => Ok(ScenarioId::MultiVehicleTrafficLight),
            "blind_intersection" => Ok(ScenarioId::BlindIntersection),
            "emergency_vehicle" => Ok(ScenarioId::EmergencyVehicle),
            "emergency_vehicle_no_lights" => Ok(ScenarioId::EmergencyVehicleNoLights),
            "drunk_driver" => Ok(ScenarioId::DrunkDriver),
            _ => Err(format!("unknown scenario: {s}")),
        }
    }
}

/// Initial state for one scenario vehicle.
#[derive(Debug, Clone)]
pub struct VehicleBlueprint {
    pub id: &'static str,
    pub x: f64,
    pub y: f64,
    /// Heading in degrees, 0 = north.
    pub heading: f64,
    pub speed: f64,
    pub target_speed: f64,
    pub intent: Intent,
    pub profile: BehaviorProfile,
}

impl VehicleBlueprint {
    fn normal(id: &'static str, x: f64, y: f64, heading: f64, speed: f64) -> Self {
        Self {
            id,
            x,
            y,
            heading,
            speed,
            target_speed: speed,
            intent: Intent::Through,
            profile: BehaviorProfile::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            let parsed: ScenarioId = scenario.name().parse().unwrap();
            assert_eq!(parsed, scenario);
        }
        assert!("not_a_scenario".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_blueprint_counts() {
        assert_eq!(ScenarioId::RightOfWay.blueprints(10.0).len(), 3);
        assert_eq!(ScenarioId::MultiVehicle.blueprints(10.0).len(), 4);
        assert_eq!(ScenarioId::BlindIntersection.blueprints(10.0).len(), 2);
        assert_eq!(ScenarioId::EmergencyVehicle.blueprints(10.0).len(), 2);
    }

    #[test]
    fn test_light_usage() {
        assert!(ScenarioId::MultiVehicleTrafficLight.uses_light());
        assert!(ScenarioId::EmergencyVehicle.uses_light());
        assert!(!ScenarioId::EmergencyVehicleNoLights.uses_light());
        assert!(!ScenarioId::RightOfWay.uses_light());
    }

    #[test]
    fn test_emergency_blueprint_profile() {
        let bps = ScenarioId::EmergencyVehicle.blueprints(10.0);
        let amb = bps.iter().find(|b| b.id == "AMBULANCE").unwrap();
        assert_eq!(amb.profile, BehaviorProfile::Emergency);
        assert!(amb.speed > 20.0);
    }
}
