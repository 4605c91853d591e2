use nalgebra::{Isometry3, Translation3, UnitQuaternion};

/// Number of rigid-body degrees of freedom carried by a jump.
pub const JUMP_DOFS: usize = 6;

/// One rigid-body component of a jump: 1..=3 are translation (Å) along x, y, z; 4..=6 are
/// roll, pitch and yaw (degrees).
pub fn jump_component(jump: &Isometry3<f64>, index: usize) -> f64 {
    let (roll, pitch, yaw) = jump.rotation.euler_angles();
    match index {
        1 => jump.translation.x,
        2 => jump.translation.y,
        3 => jump.translation.z,
        4 => roll.to_degrees(),
        5 => pitch.to_degrees(),
        6 => yaw.to_degrees(),
        _ => panic!("jump component {} out of range 1..={}", index, JUMP_DOFS),
    }
}

/// `jump` with component `index` replaced by `value` (see [`jump_component`] for units).
pub fn with_jump_component(jump: &Isometry3<f64>, index: usize, value: f64) -> Isometry3<f64> {
    let mut translation = jump.translation.vector;
    let (mut roll, mut pitch, mut yaw) = jump.rotation.euler_angles();
    match index {
        1..=3 => translation[index - 1] = value,
        4 => roll = value.to_radians(),
        5 => pitch = value.to_radians(),
        6 => yaw = value.to_radians(),
        _ => panic!("jump component {} out of range 1..={}", index, JUMP_DOFS),
    }
    Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_euler_angles(roll, pitch, yaw),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn translation_components_are_replaced_in_place() {
        let jump = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.1, 0.0, 0.0));
        let moved = with_jump_component(&jump, 2, -4.0);
        assert_eq!(jump_component(&moved, 1), 1.0);
        assert_eq!(jump_component(&moved, 2), -4.0);
        assert!((jump_component(&moved, 4) - jump_component(&jump, 4)).abs() < 1e-9);
    }

    #[test]
    fn rotation_components_round_trip_in_degrees() {
        let jump = Isometry3::identity();
        let rotated = with_jump_component(&jump, 6, 35.0);
        assert!((jump_component(&rotated, 6) - 35.0).abs() < 1e-9);
        assert!(jump_component(&rotated, 4).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn component_index_is_bounded() {
        jump_component(&Isometry3::identity(), 7);
    }
}
