/// Map a point onto the unit sphere from its first two coordinates.
/// Fewer than two coordinates map to the south pole `[0, 0, -1]`;
/// non-finite coordinates read as 0.
pub fn map_to_riemann_sphere(point: &[f64]) -> [f64; 3] {
    if point.len() < 2 {
        return [0.0, 0.0, -1.0];
    }
    let coord = |v: f64| if v.is_nan() { 0.0 } else { v };
    let theta = coord(point[0]).atan().to_degrees().to_radians();
    let phi = coord(point[1]).atan().to_degrees().to_radians();
    [
        theta.cos() * phi.cos(),
        theta.cos() * phi.sin(),
        theta.sin(),
    ]
}

pub fn magnitude(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_maps_to_south_pole() {
        assert_eq!(map_to_riemann_sphere(&[]), [0.0, 0.0, -1.0]);
        assert_eq!(map_to_riemann_sphere(&[3.0]), [0.0, 0.0, -1.0]);
    }

    #[test]
    fn result_is_on_unit_sphere() {
        for p in [[0.0, 0.0], [1.0, -2.0], [1e9, 3.5], [f64::NAN, 2.0]] {
            let s = map_to_riemann_sphere(&p);
            assert!((magnitude(&s) - 1.0).abs() < 1e-12);
        }
        let origin = map_to_riemann_sphere(&[0.0, 0.0, 99.0]);
        assert!((origin[0] - 1.0).abs() < 1e-12);
    }
}
