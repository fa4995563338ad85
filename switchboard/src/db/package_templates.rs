use crate::db::custom_types::CallKind;
use crate::schema::package_templates;
use diesel::prelude::*;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = package_templates)]
pub struct PackageTemplate {
    pub id: Uuid,
    pub name: String,
    pub kind: CallKind,
    pub duration_minutes: i32,
    pub price: Decimal,
    pub fee_percent: Decimal,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PackageTemplate {
    /// Platform commission, rounded to cents.
    pub fn fee_amount(&self) -> Decimal {
        (self.price * self.fee_percent / Decimal::ONE_HUNDRED).round_dp(2)
    }

    /// What the listener earns from one purchase of this template.
    pub fn listener_amount(&self) -> Decimal {
        self.price - self.fee_amount()
    }

    pub fn to_api(&self) -> commons::PackageInfo {
        commons::PackageInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.into(),
            duration_minutes: self.duration_minutes,
            price: self.price,
            fee_percent: self.fee_percent,
            fee_amount: self.fee_amount(),
            listener_amount: self.listener_amount(),
            active: self.active,
        }
    }
}

pub fn get(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<PackageTemplate>> {
    package_templates::table
        .filter(package_templates::id.eq(id))
        .first::<PackageTemplate>(conn)
        .optional()
}

pub fn all(conn: &mut PgConnection) -> QueryResult<Vec<PackageTemplate>> {
    package_templates::table
        .order((
            package_templates::duration_minutes.asc(),
            package_templates::price.asc(),
        ))
        .load::<PackageTemplate>(conn)
}

pub fn insert(
    conn: &mut PgConnection,
    name: &str,
    kind: CallKind,
    duration_minutes: i32,
    price: Decimal,
    fee_percent: Decimal,
) -> QueryResult<PackageTemplate> {
    diesel::insert_into(package_templates::table)
        .values((
            package_templates::id.eq(Uuid::new_v4()),
            package_templates::name.eq(name),
            package_templates::kind.eq(kind),
            package_templates::duration_minutes.eq(duration_minutes),
            package_templates::price.eq(price),
            package_templates::fee_percent.eq(fee_percent),
            package_templates::active.eq(true),
            package_templates::created_at.eq(OffsetDateTime::now_utc()),
            package_templates::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .get_result(conn)
}

pub fn set_active(conn: &mut PgConnection, id: Uuid, active: bool) -> QueryResult<usize> {
    diesel::update(package_templates::table)
        .set((
            package_templates::active.eq(active),
            package_templates::updated_at.eq(OffsetDateTime::now_utc()),
        ))
        .filter(package_templates::id.eq(id))
        .execute(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn dummy_template(price: Decimal, fee_percent: Decimal) -> PackageTemplate {
        PackageTemplate {
            id: Uuid::new_v4(),
            name: "T1".to_string(),
            kind: CallKind::Audio,
            duration_minutes: 10,
            price,
            fee_percent,
            active: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn fee_is_percentage_of_price_rounded_to_cents() {
        let template = dummy_template(dec!(20.00), dec!(10.00));
        assert_eq!(template.fee_amount(), dec!(2.00));
        assert_eq!(template.listener_amount(), dec!(18.00));
    }

    #[test]
    fn fee_rounding_keeps_amounts_summing_to_price() {
        let template = dummy_template(dec!(9.99), dec!(12.50));
        let fee = template.fee_amount();
        let listener = template.listener_amount();
        assert_eq!(fee, dec!(1.25));
        assert_eq!(fee + listener, dec!(9.99));
    }

    #[test]
    fn zero_fee_percent_gives_everything_to_the_listener() {
        let template = dummy_template(dec!(15.00), dec!(0.00));
        assert_eq!(template.fee_amount(), dec!(0.00));
        assert_eq!(template.listener_amount(), dec!(15.00));
    }
}
