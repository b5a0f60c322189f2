//! Sample robot models.

use nalgebra::{Isometry3, Vector3};

use dynplan_kinematics::{Inertial, JointKind, RobotModel};

fn limb(mass: f64, length: f64) -> Inertial {
    Inertial::cuboid(
        mass,
        Vector3::new(0.0, 0.0, -length / 2.0),
        Vector3::new(0.06, 0.06, length),
    )
}

/// Biped with a yaw-pitch hip, a knee and an ankle per leg (8 dofs), and a
/// `l_sole` / `r_sole` contact frame under each foot.
pub fn two_leg_model() -> RobotModel {
    let mut builder = RobotModel::builder(
        "pelvis",
        Inertial::cuboid(8.0, Vector3::new(0.0, 0.0, 0.05), Vector3::new(0.25, 0.3, 0.2)),
    );
    for (side, y) in [("l", 0.1), ("r", -0.1)] {
        builder = builder
            .revolute(
                &format!("{side}_hip"),
                limb(0.5, 0.05),
                &format!("{side}_hip_yaw"),
                "pelvis",
                Isometry3::translation(0.0, y, -0.1),
                Vector3::z(),
            )
            .revolute(
                &format!("{side}_thigh"),
                limb(2.0, 0.4),
                &format!("{side}_hip_pitch"),
                &format!("{side}_hip"),
                Isometry3::translation(0.0, 0.0, -0.05),
                Vector3::y(),
            )
            .revolute(
                &format!("{side}_shank"),
                limb(1.5, 0.4),
                &format!("{side}_knee"),
                &format!("{side}_thigh"),
                Isometry3::translation(0.0, 0.0, -0.4),
                Vector3::y(),
            )
            .revolute(
                &format!("{side}_foot"),
                Inertial::cuboid(0.4, Vector3::new(0.03, 0.0, -0.03), Vector3::new(0.2, 0.08, 0.05)),
                &format!("{side}_ankle"),
                &format!("{side}_shank"),
                Isometry3::translation(0.0, 0.0, -0.4),
                Vector3::y(),
            )
            .frame(
                &format!("{side}_sole"),
                &format!("{side}_foot"),
                Isometry3::translation(0.03, 0.0, -0.06),
            );
    }
    builder
        .build()
        .unwrap_or_else(|e| panic!("sample biped is well formed: {e}"))
}

/// Floating torso carrying a tilted-axis arm: shoulder and elbow revolute
/// joints, a prismatic wrist, a fixed tip and a `tool` frame (3 dofs).
pub fn arm_model() -> RobotModel {
    RobotModel::builder(
        "torso",
        Inertial::cuboid(4.0, Vector3::new(0.0, 0.0, 0.05), Vector3::new(0.3, 0.2, 0.4)),
    )
    .revolute(
        "upper",
        limb(1.0, 0.4),
        "shoulder",
        "torso",
        Isometry3::translation(0.0, 0.15, 0.2),
        Vector3::new(0.0, 1.0, 0.2),
    )
    .revolute(
        "lower",
        limb(0.5, 0.3),
        "elbow",
        "upper",
        Isometry3::translation(0.0, 0.0, -0.4),
        Vector3::new(1.0, 0.5, 0.0),
    )
    .link(
        "wrist",
        limb(0.2, 0.1),
        "slide",
        JointKind::Prismatic,
        "lower",
        Isometry3::translation(0.0, 0.0, -0.3),
        Vector3::new(0.1, 0.0, -1.0),
    )
    .link(
        "tip",
        Inertial::cuboid(0.1, Vector3::zeros(), Vector3::new(0.02, 0.02, 0.02)),
        "tip_mount",
        JointKind::Fixed,
        "wrist",
        Isometry3::translation(0.0, 0.0, -0.1),
        Vector3::zeros(),
    )
    .frame("tool", "tip", Isometry3::translation(0.02, 0.01, -0.05))
    .build()
    .unwrap_or_else(|e| panic!("sample arm is well formed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biped_has_eight_dofs_and_soles() {
        let model = two_leg_model();
        assert_eq!(model.dofs(), 8);
        assert!(model.frame_index("l_sole").is_some());
        assert!(model.frame_index("r_sole").is_some());
    }

    #[test]
    fn arm_has_three_dofs() {
        let model = arm_model();
        assert_eq!(model.dofs(), 3);
        assert_eq!(model.joints().len(), 4);
        assert!(model.frame_index("tool").is_some());
    }
}
