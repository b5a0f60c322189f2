//! Floating-base kinematic tree.
//!
//! A [`RobotModel`] is a tree of links rooted at a floating base link. Links
//! are connected by single-axis joints; fixed joints carry no degree of
//! freedom and simply fold their origin into the child link pose. Every link
//! automatically owns a frame of the same name, and additional frames (feet,
//! sensors, contact points) can be attached at constant offsets.

use std::collections::HashMap;

use nalgebra::{Isometry3, Matrix3, Translation3, UnitQuaternion, UnitVector3, Vector3};

use dynplan_core::EvaluatorError;

/// Index of a frame in [`RobotModel::frames`].
pub type FrameIndex = usize;

// ---------------------------------------------------------------------------
// JointKind
// ---------------------------------------------------------------------------

/// Joint type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JointKind {
    /// Rotation about the joint axis.
    Revolute,
    /// Translation along the joint axis.
    Prismatic,
    /// No relative motion.
    Fixed,
}

impl JointKind {
    /// Whether this joint contributes a degree of freedom.
    pub const fn is_actuated(self) -> bool {
        matches!(self, Self::Revolute | Self::Prismatic)
    }
}

// ---------------------------------------------------------------------------
// Inertial
// ---------------------------------------------------------------------------

/// Mass properties of a link, expressed in the link frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Inertial {
    /// Mass in kilograms.
    pub mass: f64,
    /// Centre of mass in the link frame.
    pub com: Vector3<f64>,
    /// Rotational inertia about the centre of mass, link-frame axes.
    pub inertia: Matrix3<f64>,
}

impl Inertial {
    pub fn new(mass: f64, com: Vector3<f64>, inertia: Matrix3<f64>) -> Self {
        Self { mass, com, inertia }
    }

    /// Solid box of the given dimensions centred at `com`.
    pub fn cuboid(mass: f64, com: Vector3<f64>, size: Vector3<f64>) -> Self {
        let (x2, y2, z2) = (size.x * size.x, size.y * size.y, size.z * size.z);
        let k = mass / 12.0;
        Self {
            mass,
            com,
            inertia: Matrix3::from_diagonal(&Vector3::new(k * (y2 + z2), k * (x2 + z2), k * (x2 + y2))),
        }
    }

    /// Massless link.
    pub fn massless() -> Self {
        Self {
            mass: 0.0,
            com: Vector3::zeros(),
            inertia: Matrix3::zeros(),
        }
    }
}

impl Default for Inertial {
    fn default() -> Self {
        Self::massless()
    }
}

// ---------------------------------------------------------------------------
// Link / Joint / Frame
// ---------------------------------------------------------------------------

/// A rigid body of the tree.
#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub inertial: Inertial,
    /// Joint connecting this link to its parent. `None` for the base.
    pub parent_joint: Option<usize>,
    /// Frame that coincides with this link.
    pub frame: FrameIndex,
}

/// A single-axis connection between two links.
#[derive(Debug, Clone)]
pub struct Joint {
    pub name: String,
    pub kind: JointKind,
    pub parent: usize,
    pub child: usize,
    /// Static transform from the parent link frame to the joint frame.
    pub origin: Isometry3<f64>,
    /// Joint axis in the joint (and child link) frame.
    pub axis: UnitVector3<f64>,
    /// Position in the joint vector, for actuated joints.
    pub dof: Option<usize>,
}

impl Joint {
    /// Transform produced by moving this joint to `position`.
    pub fn motion(&self, position: f64) -> Isometry3<f64> {
        match self.kind {
            JointKind::Revolute => Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_axis_angle(&self.axis, position),
            ),
            JointKind::Prismatic => Isometry3::from_parts(
                Translation3::from(self.axis.into_inner() * position),
                UnitQuaternion::identity(),
            ),
            JointKind::Fixed => Isometry3::identity(),
        }
    }
}

/// A named frame rigidly attached to a link.
#[derive(Debug, Clone)]
pub struct Frame {
    pub name: String,
    pub link: usize,
    /// Pose of the frame in the link frame.
    pub offset: Isometry3<f64>,
}

// ---------------------------------------------------------------------------
// RobotModel
// ---------------------------------------------------------------------------

/// Floating-base kinematic tree.
#[derive(Debug, Clone)]
pub struct RobotModel {
    links: Vec<Link>,
    joints: Vec<Joint>,
    frames: Vec<Frame>,
    frame_lookup: HashMap<String, FrameIndex>,
    /// Joints ordered so that every parent link is placed before its children.
    traversal: Vec<usize>,
    /// Actuated joint index for each degree of freedom.
    dof_joints: Vec<usize>,
}

impl RobotModel {
    /// Start a model whose floating base is `base_link`.
    pub fn builder(base_link: &str, inertial: Inertial) -> RobotModelBuilder {
        RobotModelBuilder::new(base_link, inertial)
    }

    /// Number of joint degrees of freedom.
    pub fn dofs(&self) -> usize {
        self.dof_joints.len()
    }

    /// Index of the floating base link (always 0).
    pub const fn base_link(&self) -> usize {
        0
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Joints in parent-before-child order.
    pub fn traversal(&self) -> &[usize] {
        &self.traversal
    }

    /// Joint owning each degree of freedom.
    pub fn dof_joints(&self) -> &[usize] {
        &self.dof_joints
    }

    pub fn frame_index(&self, name: &str) -> Option<FrameIndex> {
        self.frame_lookup.get(name).copied()
    }

    pub fn frame(&self, index: FrameIndex) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// Sum of all link masses.
    pub fn total_mass(&self) -> f64 {
        self.links.iter().map(|l| l.inertial.mass).sum()
    }

    /// Joints from the base down to `link`, in base-to-link order.
    pub fn path_from_base(&self, link: usize) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = link;
        while let Some(joint) = self.links[current].parent_joint {
            path.push(joint);
            current = self.joints[joint].parent;
        }
        path.reverse();
        path
    }

    /// Joints separating `from` and `to`.
    ///
    /// Returns `(up, down)`: `up` are the joints between `from` and the
    /// closest common ancestor (their child side contains `from`), `down`
    /// are those between the common ancestor and `to`.
    pub fn path_between(&self, from: usize, to: usize) -> (Vec<usize>, Vec<usize>) {
        let from_path = self.path_from_base(from);
        let to_path = self.path_from_base(to);
        let common = from_path
            .iter()
            .zip(to_path.iter())
            .take_while(|(a, b)| a == b)
            .count();
        (from_path[common..].to_vec(), to_path[common..].to_vec())
    }
}

// ---------------------------------------------------------------------------
// RobotModelBuilder
// ---------------------------------------------------------------------------

/// Incremental construction of a [`RobotModel`].
#[derive(Debug, Clone)]
pub struct RobotModelBuilder {
    links: Vec<Link>,
    joints: Vec<Joint>,
    frames: Vec<Frame>,
    errors: Vec<String>,
}

impl RobotModelBuilder {
    fn new(base_link: &str, inertial: Inertial) -> Self {
        Self {
            links: vec![Link {
                name: base_link.to_owned(),
                inertial,
                parent_joint: None,
                frame: 0,
            }],
            joints: Vec::new(),
            frames: vec![Frame {
                name: base_link.to_owned(),
                link: 0,
                offset: Isometry3::identity(),
            }],
            errors: Vec::new(),
        }
    }

    fn link_index(&self, name: &str) -> Option<usize> {
        self.links.iter().position(|l| l.name == name)
    }

    /// Attach a new link `child` to the existing link `parent`.
    ///
    /// `axis` is ignored for fixed joints.
    #[allow(clippy::too_many_arguments)]
    pub fn link(
        mut self,
        child: &str,
        inertial: Inertial,
        joint: &str,
        kind: JointKind,
        parent: &str,
        origin: Isometry3<f64>,
        axis: Vector3<f64>,
    ) -> Self {
        let Some(parent_index) = self.link_index(parent) else {
            self.errors.push(format!("joint {joint}: unknown parent link {parent}"));
            return self;
        };
        if self.link_index(child).is_some() {
            self.errors.push(format!("duplicate link {child}"));
            return self;
        }
        if self.joints.iter().any(|j| j.name == joint) {
            self.errors.push(format!("duplicate joint {joint}"));
            return self;
        }
        let axis = if kind == JointKind::Fixed {
            Vector3::z_axis()
        } else if let Some(unit) = UnitVector3::try_new(axis, 1e-12) {
            unit
        } else {
            self.errors.push(format!("joint {joint}: zero axis"));
            return self;
        };

        let child_index = self.links.len();
        let joint_index = self.joints.len();
        let frame_index = self.frames.len();
        self.joints.push(Joint {
            name: joint.to_owned(),
            kind,
            parent: parent_index,
            child: child_index,
            origin,
            axis,
            dof: None,
        });
        self.links.push(Link {
            name: child.to_owned(),
            inertial,
            parent_joint: Some(joint_index),
            frame: frame_index,
        });
        self.frames.push(Frame {
            name: child.to_owned(),
            link: child_index,
            offset: Isometry3::identity(),
        });
        self
    }

    /// Revolute joint shorthand.
    pub fn revolute(
        self,
        child: &str,
        inertial: Inertial,
        joint: &str,
        parent: &str,
        origin: Isometry3<f64>,
        axis: Vector3<f64>,
    ) -> Self {
        self.link(child, inertial, joint, JointKind::Revolute, parent, origin, axis)
    }

    /// Attach an additional frame to an existing link.
    pub fn frame(mut self, name: &str, link: &str, offset: Isometry3<f64>) -> Self {
        let Some(link_index) = self.link_index(link) else {
            self.errors.push(format!("frame {name}: unknown link {link}"));
            return self;
        };
        self.frames.push(Frame {
            name: name.to_owned(),
            link: link_index,
            offset,
        });
        self
    }

    /// Validate and finish the model.
    pub fn build(mut self) -> Result<RobotModel, EvaluatorError> {
        if let Some(first) = self.errors.first() {
            return Err(EvaluatorError::InvalidModel(first.clone()));
        }

        let mut frame_lookup = HashMap::with_capacity(self.frames.len());
        for (i, frame) in self.frames.iter().enumerate() {
            if frame_lookup.insert(frame.name.clone(), i).is_some() {
                return Err(EvaluatorError::InvalidModel(format!(
                    "duplicate frame {}",
                    frame.name
                )));
            }
        }

        // Joints are only ever attached to already-existing links, so
        // declaration order is a valid parent-before-child traversal.
        let traversal: Vec<usize> = (0..self.joints.len()).collect();

        let mut dof_joints = Vec::new();
        for (i, joint) in self.joints.iter_mut().enumerate() {
            if joint.kind.is_actuated() {
                joint.dof = Some(dof_joints.len());
                dof_joints.push(i);
            }
        }

        Ok(RobotModel {
            links: self.links,
            joints: self.joints,
            frames: self.frames,
            frame_lookup,
            traversal,
            dof_joints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(x: f64, y: f64, z: f64) -> Isometry3<f64> {
        Isometry3::translation(x, y, z)
    }

    fn two_leg() -> RobotModel {
        RobotModel::builder("pelvis", Inertial::cuboid(5.0, Vector3::zeros(), Vector3::new(0.3, 0.2, 0.1)))
            .revolute("l_thigh", Inertial::default(), "l_hip", "pelvis", offset(0.0, 0.1, 0.0), Vector3::y())
            .revolute("l_shank", Inertial::default(), "l_knee", "l_thigh", offset(0.0, 0.0, -0.4), Vector3::y())
            .revolute("r_thigh", Inertial::default(), "r_hip", "pelvis", offset(0.0, -0.1, 0.0), Vector3::y())
            .link("r_shank", Inertial::default(), "r_knee", JointKind::Prismatic, "r_thigh", offset(0.0, 0.0, -0.4), Vector3::z())
            .link("r_foot", Inertial::default(), "r_ankle", JointKind::Fixed, "r_shank", offset(0.0, 0.0, -0.4), Vector3::zeros())
            .frame("l_sole", "l_shank", offset(0.0, 0.0, -0.4))
            .build()
            .unwrap()
    }

    #[test]
    fn dofs_skip_fixed_joints() {
        let model = two_leg();
        assert_eq!(model.dofs(), 4);
        assert_eq!(model.joints().len(), 5);
        assert!(model.joints()[4].dof.is_none());
        assert_eq!(model.joints()[3].dof, Some(3));
    }

    #[test]
    fn every_link_has_a_frame() {
        let model = two_leg();
        for link in model.links() {
            assert_eq!(model.frame_index(&link.name), Some(link.frame));
        }
        assert!(model.frame_index("l_sole").is_some());
        assert!(model.frame_index("missing").is_none());
    }

    #[test]
    fn path_between_splits_at_common_ancestor() {
        let model = two_leg();
        let l_shank = model.frames()[model.frame_index("l_shank").unwrap()].link;
        let r_foot = model.frames()[model.frame_index("r_foot").unwrap()].link;
        let (up, down) = model.path_between(l_shank, r_foot);
        assert_eq!(up, vec![0, 1]);
        assert_eq!(down, vec![2, 3, 4]);

        let (up, down) = model.path_between(0, l_shank);
        assert!(up.is_empty());
        assert_eq!(down, vec![0, 1]);
    }

    #[test]
    fn unknown_parent_is_an_error() {
        let err = RobotModel::builder("base", Inertial::default())
            .revolute("a", Inertial::default(), "j", "nowhere", Isometry3::identity(), Vector3::x())
            .build()
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::InvalidModel(msg) if msg.contains("nowhere")));
    }

    #[test]
    fn duplicate_frame_is_an_error() {
        let err = RobotModel::builder("base", Inertial::default())
            .frame("base", "base", Isometry3::identity())
            .build()
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::InvalidModel(_)));
    }

    #[test]
    fn zero_axis_is_an_error() {
        let result = RobotModel::builder("base", Inertial::default())
            .revolute("a", Inertial::default(), "j", "base", Isometry3::identity(), Vector3::zeros())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn cuboid_inertia_is_diagonal() {
        let inertial = Inertial::cuboid(12.0, Vector3::zeros(), Vector3::new(1.0, 2.0, 3.0));
        assert!((inertial.inertia[(0, 0)] - 13.0).abs() < 1e-12);
        assert!((inertial.inertia[(1, 1)] - 10.0).abs() < 1e-12);
        assert!((inertial.inertia[(2, 2)] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn total_mass_sums_links() {
        assert!((two_leg().total_mass() - 5.0).abs() < 1e-12);
    }
}
