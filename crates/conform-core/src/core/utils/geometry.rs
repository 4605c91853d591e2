use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};
use std::f64::consts::PI;

const DEGENERATE_EPS: f64 = 1e-10;

/// Places a point from internal coordinates relative to three reference points.
///
/// The returned point `x` satisfies `|x - c| = distance`, `angle(b, c, x) = angle_degrees` and
/// `dihedral(a, b, c, x) = dihedral_degrees`.
///
/// # Return
///
/// `None` when the reference points are coincident or collinear, so no plane is defined.
pub fn place_atom(
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    distance: f64,
    angle_degrees: f64,
    dihedral_degrees: f64,
) -> Option<Point3<f64>> {
    let bc = c - b;
    if bc.norm() < DEGENERATE_EPS {
        return None;
    }
    let bc = bc.normalize();
    let normal = (b - a).cross(&bc);
    if normal.norm() < DEGENERATE_EPS {
        return None;
    }
    let n = normal.normalize();
    let m = n.cross(&bc);

    let theta = angle_degrees.to_radians();
    let phi = dihedral_degrees.to_radians();
    let offset = bc * (-distance * theta.cos()) + m * (distance * theta.sin() * phi.cos())
        - n * (distance * theta.sin() * phi.sin());
    Some(c + offset)
}

pub fn dihedral_degrees(
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
    p4: &Point3<f64>,
) -> f64 {
    let b1 = p2 - p1;
    let b2 = p3 - p2;
    let b3 = p4 - p3;
    let n1 = b1.cross(&b2);
    let n2 = b2.cross(&b3);
    let b2_norm = b2.norm();
    if b2_norm < DEGENERATE_EPS {
        return 0.0;
    }
    let m1 = n1.cross(&(b2 / b2_norm));
    m1.dot(&n2).atan2(n1.dot(&n2)).to_degrees()
}

pub fn bond_angle_degrees(a: &Point3<f64>, vertex: &Point3<f64>, c: &Point3<f64>) -> f64 {
    let u = a - vertex;
    let v = c - vertex;
    let denom = u.norm() * v.norm();
    if denom < DEGENERATE_EPS {
        return 0.0;
    }
    (u.dot(&v) / denom).clamp(-1.0, 1.0).acos().to_degrees()
}

/// Wraps an angle in degrees into `(-180, 180]`.
pub fn wrap_degrees(angle: f64) -> f64 {
    let mut wrapped = angle % 360.0;
    if wrapped > 180.0 {
        wrapped -= 360.0;
    } else if wrapped <= -180.0 {
        wrapped += 360.0;
    }
    wrapped
}

/// Wraps an angle in radians into `(-PI, PI]`.
pub fn wrap_radians(angle: f64) -> f64 {
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

/// Rotation about the local x axis by `angle` radians.
pub fn rotation_x(angle: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::x_axis(), angle)
}

/// Rotation about the local z axis by `angle` radians.
pub fn rotation_z(angle: f64) -> Rotation3<f64> {
    Rotation3::from_axis_angle(&Vector3::z_axis(), angle)
}

/// Least-squares rigid superposition (Kabsch) mapping `from_points` onto `to_points`.
///
/// # Return
///
/// The isometry `T` minimising `sum |T * from_i - to_i|^2`, or `None` if the inputs are empty or
/// of different lengths.
pub fn superpose(from_points: &[Point3<f64>], to_points: &[Point3<f64>]) -> Option<Isometry3<f64>> {
    if from_points.is_empty() || from_points.len() != to_points.len() {
        return None;
    }
    let count = from_points.len() as f64;
    let from_centroid = Point3::from(
        from_points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / count,
    );
    let to_centroid =
        Point3::from(to_points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / count);

    let h = from_points
        .iter()
        .zip(to_points.iter())
        .fold(Matrix3::zeros(), |acc, (f, t)| {
            acc + (t - to_centroid) * (f - from_centroid).transpose()
        });

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut correction = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        correction[(2, 2)] = -1.0;
    }
    let rotation = Rotation3::from_matrix_unchecked(u * correction * v_t);
    let translation = to_centroid.coords - rotation * from_centroid.coords;

    Some(Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    fn reference_points() -> (Point3<f64>, Point3<f64>, Point3<f64>) {
        (
            Point3::new(0.0, 1.4, 0.3),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.5, 0.0, 0.0),
        )
    }

    #[test]
    fn place_atom_reproduces_requested_internal_coordinates() {
        let (a, b, c) = reference_points();
        for dihedral in [-150.0, -47.0, 0.5, 60.0, 180.0] {
            let x = place_atom(&a, &b, &c, 1.33, 116.2, dihedral).unwrap();
            assert!(((x - c).norm() - 1.33).abs() < TOL);
            assert!((bond_angle_degrees(&b, &c, &x) - 116.2).abs() < 1e-7);
            assert!(wrap_degrees(dihedral_degrees(&a, &b, &c, &x) - dihedral).abs() < 1e-7);
        }
    }

    #[test]
    fn place_atom_rejects_collinear_references() {
        let a = Point3::new(-1.0, 0.0, 0.0);
        let b = Point3::origin();
        let c = Point3::new(1.0, 0.0, 0.0);
        assert!(place_atom(&a, &b, &c, 1.0, 109.5, 60.0).is_none());
    }

    #[test]
    fn dihedral_of_planar_cis_and_trans_arrangements() {
        let p1 = Point3::new(1.0, 1.0, 0.0);
        let p2 = Point3::new(0.0, 1.0, 0.0);
        let p3 = Point3::new(0.0, 0.0, 0.0);
        let cis = Point3::new(1.0, 0.0, 0.0);
        let trans = Point3::new(-1.0, 0.0, 0.0);
        assert!(dihedral_degrees(&p1, &p2, &p3, &cis).abs() < TOL);
        assert!((dihedral_degrees(&p1, &p2, &p3, &trans).abs() - 180.0).abs() < TOL);
    }

    #[test]
    fn wrap_degrees_maps_into_half_open_interval() {
        assert!((wrap_degrees(190.0) + 170.0).abs() < TOL);
        assert!((wrap_degrees(-180.0) - 180.0).abs() < TOL);
        assert!((wrap_degrees(540.0) - 180.0).abs() < TOL);
        assert!((wrap_degrees(-45.0) + 45.0).abs() < TOL);
    }

    #[test]
    fn superpose_recovers_pure_translation() {
        let from = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        ];
        let to: Vec<_> = from
            .iter()
            .map(|p| p + Vector3::new(10.0, 20.0, 30.0))
            .collect();
        let iso = superpose(&from, &to).unwrap();
        assert!(iso.rotation.angle().abs() < 1e-9);
        assert!((iso.translation.vector - Vector3::new(10.0, 20.0, 30.0)).norm() < 1e-9);
    }

    #[test]
    fn superpose_recovers_rotation_and_translation() {
        let from = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.5, 0.0, 0.0),
            Point3::new(2.0, 1.2, 0.0),
            Point3::new(0.3, 0.4, 1.1),
        ];
        let truth = Isometry3::new(Vector3::new(-2.0, 0.5, 4.0), Vector3::new(0.3, -1.1, 0.7));
        let to: Vec<_> = from.iter().map(|p| truth * p).collect();
        let iso = superpose(&from, &to).unwrap();
        for (f, t) in from.iter().zip(&to) {
            assert!((iso * f - t).norm() < 1e-8);
        }
    }

    #[test]
    fn superpose_rejects_mismatched_inputs() {
        assert!(superpose(&[], &[]).is_none());
        assert!(superpose(&[Point3::origin()], &[]).is_none());
    }
}
