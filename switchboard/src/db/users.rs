use crate::db::custom_types::UserRole;
use crate::schema::users;
use diesel::prelude::*;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub role: UserRole,
    pub created_at: OffsetDateTime,
}

pub fn get(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<User>> {
    users::table
        .filter(users::id.eq(id))
        .first::<User>(conn)
        .optional()
}

pub fn insert(conn: &mut PgConnection, id: Uuid, name: &str, role: UserRole) -> QueryResult<usize> {
    diesel::insert_into(users::table)
        .values((
            users::id.eq(id),
            users::name.eq(name),
            users::role.eq(role),
            users::created_at.eq(OffsetDateTime::now_utc()),
        ))
        .execute(conn)
}
