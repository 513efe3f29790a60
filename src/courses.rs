//! Read-only queries against the course catalog and enrollment records,
//! which belong to the surrounding portal.

use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::session::Principal;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub teacher_id: i64,
}

pub async fn fetch(db_pool: &SqlitePool, course_id: i64) -> Result<Option<Course>, sqlx::Error> {
    sqlx::query_as("SELECT id,title,teacher_id FROM courses WHERE id=?")
        .bind(course_id)
        .fetch_optional(db_pool)
        .await
}

/// Session managers are the course's teacher and portal admins.
pub fn can_manage(principal: &Principal, course: &Course) -> bool {
    principal.is_admin || principal.id == course.teacher_id
}

/// Whether the user is enrolled in an offering of this course whose term
/// window covers the current instant.
pub async fn is_active_in_course(
    db_pool: &SqlitePool,
    user_id: i64,
    course_id: i64,
) -> Result<bool, sqlx::Error> {
    let now = OffsetDateTime::now_utc();
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM enrollments e \
         JOIN course_offerings o ON o.id=e.offering_id \
         WHERE e.user_id=? AND o.course_id=? AND o.term_start<=? AND o.term_end>=?",
    )
    .bind(user_id)
    .bind(course_id)
    .bind(now)
    .bind(now)
    .fetch_optional(db_pool)
    .await?;
    Ok(row.is_some())
}

/// User ids of everyone enrolled in the course's current offering.
pub async fn enrolled_students(
    db_pool: &SqlitePool,
    course_id: i64,
) -> Result<Vec<i64>, sqlx::Error> {
    let now = OffsetDateTime::now_utc();
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT e.user_id FROM enrollments e \
         JOIN course_offerings o ON o.id=e.offering_id \
         WHERE o.course_id=? AND o.term_start<=? AND o.term_end>=?",
    )
    .bind(course_id)
    .bind(now)
    .bind(now)
    .fetch_all(db_pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
pub(crate) mod seed {
    use sqlx::SqlitePool;
    use time::{Duration, OffsetDateTime};

    pub async fn user(pool: &SqlitePool, id: i64, display_name: &str, is_admin: bool) {
        sqlx::query("INSERT INTO users (id,display_name,is_admin) VALUES (?,?,?)")
            .bind(id)
            .bind(display_name)
            .bind(is_admin)
            .execute(pool)
            .await
            .unwrap();
    }

    pub async fn course(pool: &SqlitePool, id: i64, title: &str, teacher_id: i64) {
        sqlx::query("INSERT INTO courses (id,title,teacher_id) VALUES (?,?,?)")
            .bind(id)
            .bind(title)
            .bind(teacher_id)
            .execute(pool)
            .await
            .unwrap();
    }

    pub async fn offering(
        pool: &SqlitePool,
        id: i64,
        course_id: i64,
        term_start: OffsetDateTime,
        term_end: OffsetDateTime,
    ) {
        sqlx::query(
            "INSERT INTO course_offerings (id,course_id,term_start,term_end) VALUES (?,?,?,?)",
        )
        .bind(id)
        .bind(course_id)
        .bind(term_start)
        .bind(term_end)
        .execute(pool)
        .await
        .unwrap();
    }

    pub async fn enroll(pool: &SqlitePool, user_id: i64, offering_id: i64) {
        sqlx::query("INSERT INTO enrollments (user_id,offering_id) VALUES (?,?)")
            .bind(user_id)
            .bind(offering_id)
            .execute(pool)
            .await
            .unwrap();
    }

    /// A teacher, a course with an in-progress offering, and the given
    /// students enrolled in it.
    pub async fn running_course(
        pool: &SqlitePool,
        course_id: i64,
        teacher_id: i64,
        student_ids: &[i64],
    ) {
        let now = OffsetDateTime::now_utc();
        user(pool, teacher_id, "Prof. Lovelace", false).await;
        course(pool, course_id, "Introduction to Computer Science", teacher_id).await;
        let offering_id = course_id * 100;
        offering(
            pool,
            offering_id,
            course_id,
            now - Duration::days(30),
            now + Duration::days(60),
        )
        .await;
        for &student_id in student_ids {
            user(pool, student_id, &format!("student-{student_id}"), false).await;
            enroll(pool, student_id, offering_id).await;
        }
    }
}
