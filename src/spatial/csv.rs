//! Contour files: plain-text point lists turned into a MULTIPOLYGON.
//!
//! One point per line as `a;b`, written to WKT as `b a`. A blank line
//! separates polygons. Within a polygon a ring ends when its first point
//! repeats; the next point starts a new (inner) ring.

use crate::error::{RegistryError, Result};

/// Attachments with this extension are read as contours.
pub const CONTOUR_EXTENSION: &str = ".csv";

pub fn is_contour_file(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(CONTOUR_EXTENSION)
}

/// Parse contour text into MULTIPOLYGON WKT.
pub fn parse_contours(content: &str) -> Result<String> {
    let content = content.replace('\r', "");
    let mut polygons = Vec::new();

    for (block_no, block) in content.split("\n\n").enumerate() {
        let mut rings: Vec<Vec<String>> = vec![Vec::new()];
        for line in block.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split(';').map(str::trim);
            let (Some(a), Some(b)) = (parts.next(), parts.next()) else {
                return Err(RegistryError::invalid_value(
                    "geometry",
                    format!("polygon {}: point '{line}' is not 'a;b'", block_no + 1),
                ));
            };
            let point = format!("{} {}", coordinate(b, line)?, coordinate(a, line)?);

            let Some(ring) = rings.last_mut() else {
                continue;
            };
            let closes = ring.first() == Some(&point);
            ring.push(point);
            if closes {
                rings.push(Vec::new());
            }
        }

        let rings: Vec<String> = rings
            .into_iter()
            .filter(|r| !r.is_empty())
            .map(|r| format!("({})", r.join(",")))
            .collect();
        if !rings.is_empty() {
            polygons.push(format!("({})", rings.join(",")));
        }
    }

    if polygons.is_empty() {
        return Err(RegistryError::invalid_value("geometry", "contour file has no points"));
    }
    Ok(format!("MULTIPOLYGON ({})", polygons.join(",")))
}

/// Decimal commas are accepted.
fn coordinate(raw: &str, line: &str) -> Result<String> {
    let normalized = raw.replace(',', ".");
    normalized
        .parse::<f64>()
        .map(|_| normalized.clone())
        .map_err(|_| RegistryError::invalid_value("geometry", format!("'{raw}' in '{line}' is not a coordinate")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_closed_ring() {
        let wkt = parse_contours("10;1\r\n20;1\r\n20;2\r\n10;1\r\n").unwrap();
        assert_eq!(wkt, "MULTIPOLYGON (((1 10,1 20,2 20,1 10)))");
    }

    #[test]
    fn hole_and_second_polygon() {
        let content = "0;0\n10;0\n10;10\n0;0\n2;2\n3;2\n3;3\n2;2\n\n50;50\n60;50\n60;60\n50;50";
        let wkt = parse_contours(content).unwrap();
        assert_eq!(
            wkt,
            "MULTIPOLYGON (((0 0,0 10,10 10,0 0),(2 2,2 3,3 3,2 2)),((50 50,50 60,60 60,50 50)))"
        );
    }

    #[test]
    fn decimal_commas_and_bad_points() {
        let wkt = parse_contours("1,5;2,5\n3;4\n1,5;2,5").unwrap();
        assert_eq!(wkt, "MULTIPOLYGON (((2.5 1.5,4 3,2.5 1.5)))");

        assert!(parse_contours("abc;1\n").is_err());
        assert!(parse_contours("12\n").is_err());
        assert!(parse_contours("\n\n").is_err());
    }

    #[test]
    fn contour_extension() {
        assert!(is_contour_file("plot.CSV"));
        assert!(!is_contour_file("plot.xlsx"));
    }
}
