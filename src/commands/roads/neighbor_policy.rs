#[derive(Copy, Clone, Debug)]
pub struct GridPolicy {
    /// Distance in blocks between neighbouring search nodes.
    pub step: i32,
    pub allow_diagonals: bool,
}

impl Default for GridPolicy {
    fn default() -> Self {
        Self { step: 4, allow_diagonals: true }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Offset(pub i32, pub i32);

impl Offset {
    pub fn is_diagonal(self) -> bool {
        self.0 != 0 && self.1 != 0
    }
}

/// Local travel direction of a road, used to pick the shape of its cross-section.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TravelDirection {
    /// Moving along x; the cross-section spans z.
    AxisX,
    /// Moving along z; the cross-section spans x.
    AxisZ,
    /// dx and dz share a sign.
    DiagonalPos,
    /// dx and dz have opposite signs.
    DiagonalNeg,
}

impl TravelDirection {
    pub fn classify(dx: i32, dz: i32) -> TravelDirection {
        match (dx.signum(), dz.signum()) {
            (0, 0) => TravelDirection::AxisX,
            (_, 0) => TravelDirection::AxisX,
            (0, _) => TravelDirection::AxisZ,
            (sx, sz) if sx == sz => TravelDirection::DiagonalPos,
            _ => TravelDirection::DiagonalNeg,
        }
    }

    /// Unit vector perpendicular to the travel direction in the (x, z) plane.
    pub fn perpendicular(self) -> Offset {
        match self {
            TravelDirection::AxisX => Offset(0, 1),
            TravelDirection::AxisZ => Offset(1, 0),
            TravelDirection::DiagonalPos => Offset(1, -1),
            TravelDirection::DiagonalNeg => Offset(1, 1),
        }
    }

    pub fn is_diagonal(self) -> bool {
        matches!(self, TravelDirection::DiagonalPos | TravelDirection::DiagonalNeg)
    }
}

impl GridPolicy {
    pub fn new(step: i32) -> Self {
        Self { step: step.max(1), ..Self::default() }
    }

    pub fn neighbor_offsets(&self) -> Vec<Offset> {
        const CARD: [Offset; 4] = [Offset(1,0), Offset(-1,0), Offset(0,1), Offset(0,-1)];
        const DIAG: [Offset; 4] = [Offset(1,1), Offset(1,-1), Offset(-1,1), Offset(-1,-1)];
        let s = self.step;
        let mut out: Vec<Offset> = CARD.iter().map(|&Offset(dx, dz)| Offset(dx * s, dz * s)).collect();
        if self.allow_diagonals {
            out.extend(DIAG.iter().map(|&Offset(dx, dz)| Offset(dx * s, dz * s)));
        }
        out
    }

    /// Snaps a block coordinate onto the search grid (nearest multiple of `step`).
    pub fn snap(&self, v: i32) -> i32 {
        let s = self.step;
        let half = s / 2;
        (v + half).div_euclid(s) * s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_offsets_no_diagonals() {
        let p = GridPolicy { step: 4, allow_diagonals: false };
        let offs = p.neighbor_offsets();
        assert_eq!(offs.len(), 4);
        assert!(offs.contains(&Offset(4,0)));
        assert!(offs.contains(&Offset(-4,0)));
        assert!(offs.contains(&Offset(0,4)));
        assert!(offs.contains(&Offset(0,-4)));
    }

    #[test]
    fn neighbor_offsets_with_diagonals() {
        let p = GridPolicy::new(4);
        let offs = p.neighbor_offsets();
        assert_eq!(offs.len(), 8);
        assert!(offs.contains(&Offset(4,4)));
        assert!(offs.contains(&Offset(-4,-4)));
        assert_eq!(offs.iter().filter(|o| o.is_diagonal()).count(), 4);
    }

    #[test]
    fn snap_rounds_to_nearest_multiple() {
        let p = GridPolicy::new(4);
        assert_eq!(p.snap(0), 0);
        assert_eq!(p.snap(1), 0);
        assert_eq!(p.snap(2), 4);
        assert_eq!(p.snap(41), 40);
        assert_eq!(p.snap(-3), -4);
        assert_eq!(p.snap(-1), 0);
    }

    #[test]
    fn classify_directions() {
        assert_eq!(TravelDirection::classify(4, 0), TravelDirection::AxisX);
        assert_eq!(TravelDirection::classify(-4, 0), TravelDirection::AxisX);
        assert_eq!(TravelDirection::classify(0, 4), TravelDirection::AxisZ);
        assert_eq!(TravelDirection::classify(4, 4), TravelDirection::DiagonalPos);
        assert_eq!(TravelDirection::classify(-4, -4), TravelDirection::DiagonalPos);
        assert_eq!(TravelDirection::classify(4, -4), TravelDirection::DiagonalNeg);
    }
}
