//! Turning points of registry records (`register.turning_points`)

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use crate::error::Result;

/// One ordered vertex of a record's contour. `id` is `None` for points that
/// have not been stored yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TurningPoint {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub contour_id: Option<Uuid>,
    #[serde(default)]
    pub spatial_element_id: Option<Uuid>,
    pub ordinal_number: i32,
    #[serde(default)]
    pub geopoint_number: Option<i32>,
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Debug)]
pub struct TurningPointRepository {
    pool: PgPool,
}

impl TurningPointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, registry_id: Uuid, item_id: Uuid) -> Result<Vec<TurningPoint>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_on(&mut conn, registry_id, item_id).await
    }

    pub async fn list_on(
        conn: &mut PgConnection,
        registry_id: Uuid,
        item_id: Uuid,
    ) -> Result<Vec<TurningPoint>> {
        let points = sqlx::query_as::<_, TurningPoint>(
            r#"
            SELECT id, contour_id, spatial_element_id, ordinal_number, geopoint_number, x, y
            FROM register.turning_points
            WHERE registry_id = $1 AND item_id = $2
            ORDER BY contour_id NULLS FIRST, ordinal_number
            "#,
        )
        .bind(registry_id)
        .bind(item_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(points)
    }

    pub async fn insert_all(
        conn: &mut PgConnection,
        registry_id: Uuid,
        item_id: Uuid,
        points: &[TurningPoint],
        actor_name: &str,
    ) -> Result<()> {
        for point in points {
            sqlx::query(
                r#"
                INSERT INTO register.turning_points
                    (id, registry_id, item_id, contour_id, spatial_element_id,
                     ordinal_number, geopoint_number, x, y, created_by)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(registry_id)
            .bind(item_id)
            .bind(point.contour_id)
            .bind(point.spatial_element_id)
            .bind(point.ordinal_number)
            .bind(point.geopoint_number)
            .bind(point.x)
            .bind(point.y)
            .bind(actor_name)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub async fn delete_ids(conn: &mut PgConnection, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(r#"DELETE FROM register.turning_points WHERE id = ANY($1)"#)
            .bind(ids)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_for_item(
        conn: &mut PgConnection,
        registry_id: Uuid,
        item_id: Uuid,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"DELETE FROM register.turning_points WHERE registry_id = $1 AND item_id = $2"#,
        )
        .bind(registry_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_points_deserialize_without_id() {
        let point: TurningPoint = serde_json::from_value(json!({
            "ordinal_number": 1,
            "x": 61.25,
            "y": 73.4
        }))
        .unwrap();
        assert_eq!(point.id, None);
        assert_eq!(point.ordinal_number, 1);
    }
}
