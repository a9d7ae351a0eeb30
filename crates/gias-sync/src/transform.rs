//! Typed production tables, populated from staging by set-based queries.

use std::collections::BTreeMap;

use gias_core::PRODUCTION_TABLES;
use tracing::info;

use crate::db::Database;
use crate::staging::LoadError;

const CREATE_POSTGIS: &str = "create extension if not exists postgis";

/// Enum types used by `schools`, in creation order.
const TYPES: [(&str, &str); 3] = [
    (
        "gender",
        r#"
        drop type if exists gender cascade;
        create type gender as enum ('Boys', 'Girls', 'Mixed', 'Not applicable');
        "#,
    ),
    (
        "phase",
        r#"
        drop type if exists phase cascade;
        create type phase as enum (
            'Not applicable',
            'Nursery',
            'Primary',
            'Middle deemed primary',
            'Secondary',
            'Middle deemed secondary',
            '16 plus',
            'All-through'
        );
        "#,
    ),
    (
        "ofsted_rating",
        r#"
        drop type if exists ofsted_rating cascade;
        create type ofsted_rating as enum (
            'Outstanding',
            'Good',
            'Requires improvement',
            'Inadequate',
            'Serious Weaknesses',
            'Special Measures',
            'Insufficient evidence'
        );
        "#,
    ),
];

const CREATE_SCHOOLS: &str = r#"
create table schools (
    urn integer primary key,
    local_authority_code integer,
    local_authority_name text,
    establishment_number integer,
    name text not null,
    type text,
    type_group text,
    status text,
    phase phase,
    open_date date,
    close_date date,
    statutory_low_age smallint,
    statutory_high_age smallint,
    gender gender,
    capacity integer,
    pupils integer,
    boys integer,
    girls integer,
    percentage_fsm numeric(5, 2),
    trust_code integer,
    trust_name text,
    ukprn integer,
    street text,
    locality text,
    address3 text,
    town text,
    county text,
    postcode text,
    website text,
    telephone text,
    email text,
    head_title text,
    head_first_name text,
    head_last_name text,
    region text,
    district_code text,
    district_name text,
    urban_rural text,
    ofsted_rating ofsted_rating,
    ofsted_last_inspection date,
    easting integer,
    northing integer,
    coordinates geometry(Point, 27700)
);
create index schools_coordinates_idx on schools using gist (coordinates);
create index schools_trust_code_idx on schools (trust_code);
"#;

const CREATE_DEPRIVATION_PUPIL_PREMIUM: &str = r#"
create table deprivation_pupil_premium (
    urn integer primary key references schools (urn),
    pupils_on_roll integer,
    fsm6_pupils integer,
    total_allocation numeric(12, 2)
);
"#;

const CREATE_REGIONS: &str = r#"
create table regions (
    id integer primary key,
    code text not null,
    ons_code text,
    name text not null,
    boundary geometry(MultiPolygon, 27700)
);
create index regions_boundary_idx on regions using gist (boundary);
"#;

const CREATE_LOCAL_AUTHORITIES: &str = r#"
create table local_authorities (
    id integer primary key,
    code text not null,
    ons_code text,
    name text not null,
    name_welsh text,
    boundary geometry(MultiPolygon, 27700)
);
create index local_authorities_boundary_idx on local_authorities using gist (boundary);
"#;

const IMPORT_SCHOOLS: &str = r#"
insert into schools (
    urn, local_authority_code, local_authority_name, establishment_number, name,
    type, type_group, status, phase, open_date, close_date,
    statutory_low_age, statutory_high_age, gender, capacity, pupils, boys, girls,
    percentage_fsm, trust_code, trust_name, ukprn,
    street, locality, address3, town, county, postcode, website, telephone, email,
    head_title, head_first_name, head_last_name,
    region, district_code, district_name, urban_rural,
    ofsted_rating, ofsted_last_inspection, easting, northing, coordinates
)
select
    s.urn::integer,
    nullif(s.la_code, '')::integer,
    nullif(s.la_name, ''),
    nullif(s.establishment_number, '')::integer,
    s.establishment_name,
    nullif(s.type_of_establishment_name, ''),
    nullif(s.establishment_type_group_name, ''),
    nullif(s.establishment_status_name, ''),
    nullif(s.phase_of_education_name, '')::phase,
    to_date(nullif(s.open_date, ''), 'DD-MM-YYYY'),
    to_date(nullif(s.close_date, ''), 'DD-MM-YYYY'),
    nullif(s.statutory_low_age, '')::smallint,
    nullif(s.statutory_high_age, '')::smallint,
    nullif(s.gender_name, '')::gender,
    nullif(s.school_capacity, '')::integer,
    nullif(s.number_of_pupils, '')::integer,
    nullif(s.number_of_boys, '')::integer,
    nullif(s.number_of_girls, '')::integer,
    case when s.percentage_fsm ~ '^[0-9]+(\.[0-9]+)?$' then s.percentage_fsm::numeric(5, 2) end,
    nullif(s.trusts_code, '')::integer,
    nullif(s.trusts_name, ''),
    nullif(s.ukprn, '')::integer,
    nullif(s.street, ''),
    nullif(s.locality, ''),
    nullif(s.address3, ''),
    nullif(s.town, ''),
    nullif(s.county_name, ''),
    nullif(s.postcode, ''),
    nullif(s.school_website, ''),
    nullif(s.telephone_num, ''),
    e.email,
    nullif(s.head_title_name, ''),
    nullif(s.head_first_name, ''),
    nullif(s.head_last_name, ''),
    nullif(s.gor_name, ''),
    nullif(s.district_administrative_code, ''),
    nullif(s.district_administrative_name, ''),
    nullif(s.urban_rural_name, ''),
    nullif(s.ofsted_rating_name, '')::ofsted_rating,
    to_date(nullif(s.ofsted_last_insp, ''), 'DD-MM-YYYY'),
    nullif(s.easting, '')::integer,
    nullif(s.northing, '')::integer,
    case
        when s.easting ~ '^[0-9]+$' and s.northing ~ '^[0-9]+$'
        then st_setsrid(st_makepoint(s.easting::integer, s.northing::integer), 27700)
    end
from schools_raw s
left join (
    select distinct on (urn) urn, nullif(email, '') as email
      from email_addresses_raw
     order by urn, email
) e on e.urn = s.urn
"#;

const IMPORT_DEPRIVATION_PUPIL_PREMIUM: &str = r#"
insert into deprivation_pupil_premium (urn, pupils_on_roll, fsm6_pupils, total_allocation)
select distinct on (d.urn::integer)
    d.urn::integer,
    nullif(regexp_replace(d.pupils_on_roll, '[^0-9]', '', 'g'), '')::integer,
    nullif(regexp_replace(d.fsm6_pupils, '[^0-9]', '', 'g'), '')::integer,
    nullif(regexp_replace(d.total_allocation, '[^0-9.]', '', 'g'), '')::numeric(12, 2)
from deprivation_pupil_premium_raw d
join schools_raw s on s.urn = d.urn
where d.urn ~ '^[0-9]+$'
order by d.urn::integer, d.pupils_on_roll, d.fsm6_pupils, d.total_allocation
"#;

const IMPORT_REGIONS: &str = r#"
insert into regions (id, code, ons_code, name, boundary)
select
    ogc_fid::integer,
    eer13cd,
    nullif(eer13cdo, ''),
    eer13nm,
    st_multi(st_setsrid(wkb_geometry::geometry, 27700))
from electoral_regions_raw
"#;

const IMPORT_LOCAL_AUTHORITIES: &str = r#"
insert into local_authorities (id, code, ons_code, name, name_welsh, boundary)
select
    ogc_fid::integer,
    lad13cd,
    nullif(lad13cdo, ''),
    lad13nm,
    nullif(lad13nmw, ''),
    st_multi(st_setsrid(wkb_geometry::geometry, 27700))
from local_authority_districts_raw
"#;

/// Creation order matters: `deprivation_pupil_premium` references `schools`.
const PRODUCTION_DDL: [(&str, &str); 4] = [
    ("schools", CREATE_SCHOOLS),
    ("deprivation_pupil_premium", CREATE_DEPRIVATION_PUPIL_PREMIUM),
    ("regions", CREATE_REGIONS),
    ("local_authorities", CREATE_LOCAL_AUTHORITIES),
];

const PRODUCTION_DML: [(&str, &str); 4] = [
    ("schools", IMPORT_SCHOOLS),
    ("deprivation_pupil_premium", IMPORT_DEPRIVATION_PUPIL_PREMIUM),
    ("regions", IMPORT_REGIONS),
    ("local_authorities", IMPORT_LOCAL_AUTHORITIES),
];

pub fn drop_production_sql() -> String {
    format!("drop table if exists {} cascade", PRODUCTION_TABLES.join(", "))
}

pub struct TransformLoader<'a> {
    db: &'a mut dyn Database,
}

impl<'a> TransformLoader<'a> {
    pub fn new(db: &'a mut dyn Database) -> Self {
        Self { db }
    }

    /// Drop every production table (and, by cascade, the views and keys that depend on them).
    pub async fn drop_production(&mut self) -> Result<(), LoadError> {
        self.db
            .execute(&drop_production_sql())
            .await
            .map_err(|source| LoadError::DropFailed {
                what: "production tables".to_string(),
                source,
            })?;
        info!("dropped production tables");
        Ok(())
    }

    pub async fn ensure_extensions(&mut self) -> Result<(), LoadError> {
        self.ddl("postgis", CREATE_POSTGIS).await
    }

    /// Enum types first, then tables in dependency order.
    pub async fn create_production_schema(&mut self) -> Result<(), LoadError> {
        for (name, sql) in TYPES {
            self.ddl(name, sql).await?;
        }
        for (table, sql) in PRODUCTION_DDL {
            self.ddl(table, sql).await?;
            info!(table, "created production table");
        }
        Ok(())
    }

    /// Returns inserted row counts per table. Any coercion failure aborts the whole population.
    pub async fn populate_from_staging(&mut self) -> Result<BTreeMap<String, u64>, LoadError> {
        let mut counts = BTreeMap::new();
        for (table, sql) in PRODUCTION_DML {
            let rows = self
                .db
                .execute(sql)
                .await
                .map_err(|source| LoadError::TypeCoercionFailed {
                    table: table.to_string(),
                    source,
                })?;
            info!(table, rows, "populated production table");
            counts.insert(table.to_string(), rows);
        }
        Ok(counts)
    }

    async fn ddl(&mut self, object: &str, sql: &str) -> Result<(), LoadError> {
        self.db
            .execute(sql)
            .await
            .map(|_| ())
            .map_err(|source| LoadError::ProductionSchemaFailed {
                object: object.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_statement_cascades_over_every_production_table() {
        let sql = drop_production_sql();
        assert!(sql.ends_with("cascade"));
        for table in PRODUCTION_TABLES {
            assert!(sql.contains(table));
        }
    }

    #[test]
    fn every_created_table_is_populated_in_the_same_order() {
        let created = PRODUCTION_DDL.map(|(t, _)| t);
        let populated = PRODUCTION_DML.map(|(t, _)| t);
        assert_eq!(created, populated);
        for (table, sql) in PRODUCTION_DML {
            assert!(sql.contains(&format!("insert into {table} ")));
        }
    }

    #[test]
    fn schools_joins_supplementary_staging_rows() {
        assert!(IMPORT_SCHOOLS.contains("from schools_raw s"));
        assert!(IMPORT_SCHOOLS.contains("email_addresses_raw"));
        assert!(IMPORT_DEPRIVATION_PUPIL_PREMIUM.contains("join schools_raw s"));
    }

    #[test]
    fn duplicate_premium_rows_resolve_on_every_column() {
        let order_by = IMPORT_DEPRIVATION_PUPIL_PREMIUM
            .split_once("order by")
            .map(|(_, rest)| rest.trim())
            .expect("order by clause");
        assert_eq!(
            order_by,
            "d.urn::integer, d.pupils_on_roll, d.fsm6_pupils, d.total_allocation"
        );
    }

    #[test]
    fn open_vocabulary_columns_stay_text() {
        for column in ["    type text,", "    type_group text,", "    urban_rural text,"] {
            assert!(CREATE_SCHOOLS.contains(column), "{column}");
        }
        let created = TYPES.map(|(name, _)| name);
        assert_eq!(created, ["gender", "phase", "ofsted_rating"]);
    }
}
