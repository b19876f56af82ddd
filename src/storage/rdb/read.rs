//! Paged definition reads
//!
//! Matching definition ids are walked in ascending pages; each page is then loaded with one `IN`
//! query per child table and assembled in memory.

use sqlx::{AnyConnection, Row};
use std::collections::HashMap;

use super::dialect::{Dialect, Value, bind_values, in_list};
use crate::error::Result;
use crate::family::Partition;
use crate::meta::parse_timestamp;
use crate::models::{Advisory, Bugzilla, Cpe, Cve, Debian, Definition, Package, Reference};

/// Definition ids fetched per round trip
pub const PAGE_SIZE: i64 = 998;

/// What the id scan joins on
#[derive(Debug, Clone, Copy)]
pub enum Match<'a> {
    /// Definitions listing the package; with an arch, only that arch's entry counts.
    Package { name: &'a str, arch: Option<&'a str> },
    /// Definitions whose advisory references the CVE
    Cve { cve_id: &'a str },
}

/// Load every definition of the partition that satisfies `filter`.
///
/// `package_arch` restricts the preloaded package list.
pub async fn definitions(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
    filter: Match<'_>,
    package_arch: Option<&str>,
) -> Result<Vec<Definition>> {
    let mut defs = Vec::new();
    let mut last_id = 0i64;

    loop {
        let ids = page_ids(conn, dialect, partition, filter, last_id).await?;
        let Some(&max_id) = ids.last() else {
            break;
        };
        let full_page = ids.len() as i64 == PAGE_SIZE;

        defs.extend(load(conn, dialect, &ids, package_arch).await?);
        if !full_page {
            break;
        }
        last_id = max_id;
    }
    Ok(defs)
}

async fn page_ids(
    conn: &mut AnyConnection,
    dialect: Dialect,
    partition: &Partition,
    filter: Match<'_>,
    after_id: i64,
) -> Result<Vec<i64>> {
    let mut sql = String::from(
        "SELECT DISTINCT d.id FROM definitions d JOIN roots r ON r.id = d.root_id ",
    );
    let mut values: Vec<Value> = Vec::new();

    match filter {
        Match::Package { name, arch } => {
            sql.push_str("JOIN packages p ON p.def_id = d.id WHERE p.name = ? ");
            values.push(name.into());
            if let Some(arch) = arch {
                sql.push_str("AND p.arch = ? ");
                values.push(arch.into());
            }
        }
        Match::Cve { cve_id } => {
            sql.push_str(
                "JOIN advisories a ON a.def_id = d.id JOIN cves c ON c.advisory_id = a.id \
                 WHERE c.cve_id = ? ",
            );
            values.push(cve_id.into());
        }
    }
    sql.push_str("AND r.family = ? AND r.os_version = ? AND d.id > ? ORDER BY d.id LIMIT ?");
    values.push(partition.family_name().into());
    values.push(partition.version.as_str().into());
    values.push(after_id.into());
    values.push(PAGE_SIZE.into());

    let rows = bind_values(sqlx::query(&dialect.rebind(&sql)), &values)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| row.try_get::<i64, _>(0).map_err(Into::into))
        .collect()
}

/// Assemble full definitions for a page of ids, in id order.
async fn load(
    conn: &mut AnyConnection,
    dialect: Dialect,
    ids: &[i64],
    package_arch: Option<&str>,
) -> Result<Vec<Definition>> {
    let id_values: Vec<Value> = ids.iter().map(|id| Value::Int(*id)).collect();

    let def_rows = fetch_children(
        conn,
        dialect,
        "SELECT id, definition_id, title, description FROM definitions",
        "id",
        &id_values,
        None,
    )
    .await?;

    let mut packages: HashMap<i64, Vec<Package>> = HashMap::new();
    let arch_filter = package_arch.map(|arch| ("arch", Value::from(arch)));
    for row in fetch_children(
        conn,
        dialect,
        "SELECT def_id, name, version, arch, not_fixed_yet, modularity_label FROM packages",
        "def_id",
        &id_values,
        arch_filter,
    )
    .await?
    {
        let not_fixed_yet: i64 = row.try_get("not_fixed_yet")?;
        packages
            .entry(row.try_get("def_id")?)
            .or_default()
            .push(Package {
                name: row.try_get("name")?,
                version: row.try_get("version")?,
                arch: row.try_get("arch")?,
                not_fixed_yet: not_fixed_yet != 0,
                modularity_label: row.try_get("modularity_label")?,
            });
    }

    let mut references: HashMap<i64, Vec<Reference>> = HashMap::new();
    for row in fetch_children(
        conn,
        dialect,
        "SELECT def_id, source, ref_id, ref_url FROM definition_references",
        "def_id",
        &id_values,
        None,
    )
    .await?
    {
        references
            .entry(row.try_get("def_id")?)
            .or_default()
            .push(Reference {
                source: row.try_get("source")?,
                ref_id: row.try_get("ref_id")?,
                ref_url: row.try_get("ref_url")?,
            });
    }

    let mut debians: HashMap<i64, Debian> = HashMap::new();
    for row in fetch_children(
        conn,
        dialect,
        "SELECT def_id, cve_id, more_info FROM debians",
        "def_id",
        &id_values,
        None,
    )
    .await?
    {
        debians.entry(row.try_get("def_id")?).or_insert(Debian {
            cve_id: row.try_get("cve_id")?,
            more_info: row.try_get("more_info")?,
        });
    }

    let mut advisories = load_advisories(conn, dialect, &id_values).await?;

    let mut defs = Vec::with_capacity(def_rows.len());
    for row in def_rows {
        let id: i64 = row.try_get("id")?;
        defs.push(Definition {
            definition_id: row.try_get("definition_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            advisory: advisories.remove(&id).unwrap_or_default(),
            debian: debians.remove(&id),
            affected_packs: packages.remove(&id).unwrap_or_default(),
            references: references.remove(&id).unwrap_or_default(),
        });
    }
    Ok(defs)
}

/// Advisories with their CVEs, bugzillas and CPEs, keyed by definition row id
async fn load_advisories(
    conn: &mut AnyConnection,
    dialect: Dialect,
    def_ids: &[Value],
) -> Result<HashMap<i64, Advisory>> {
    let rows = fetch_children(
        conn,
        dialect,
        "SELECT id, def_id, severity, issued, updated FROM advisories",
        "def_id",
        def_ids,
        None,
    )
    .await?;
    if rows.is_empty() {
        return Ok(HashMap::new());
    }

    let mut by_advisory: HashMap<i64, (i64, Advisory)> = HashMap::new();
    let mut advisory_ids = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.try_get("id")?;
        let issued: String = row.try_get("issued")?;
        let updated: String = row.try_get("updated")?;
        let advisory = Advisory {
            severity: row.try_get("severity")?,
            issued: parse_timestamp(&issued)?,
            updated: parse_timestamp(&updated)?,
            ..Default::default()
        };
        by_advisory.insert(id, (row.try_get("def_id")?, advisory));
        advisory_ids.push(Value::Int(id));
    }

    for row in fetch_children(
        conn,
        dialect,
        "SELECT advisory_id, cve_id, cvss2, cvss3, cwe, impact, href, public_date FROM cves",
        "advisory_id",
        &advisory_ids,
        None,
    )
    .await?
    {
        let advisory_id: i64 = row.try_get("advisory_id")?;
        if let Some((_, advisory)) = by_advisory.get_mut(&advisory_id) {
            advisory.cves.push(Cve {
                cve_id: row.try_get("cve_id")?,
                cvss2: row.try_get("cvss2")?,
                cvss3: row.try_get("cvss3")?,
                cwe: row.try_get("cwe")?,
                impact: row.try_get("impact")?,
                href: row.try_get("href")?,
                public: row.try_get("public_date")?,
            });
        }
    }

    for row in fetch_children(
        conn,
        dialect,
        "SELECT advisory_id, bugzilla_id, url, title FROM bugzillas",
        "advisory_id",
        &advisory_ids,
        None,
    )
    .await?
    {
        let advisory_id: i64 = row.try_get("advisory_id")?;
        if let Some((_, advisory)) = by_advisory.get_mut(&advisory_id) {
            advisory.bugzillas.push(Bugzilla {
                bugzilla_id: row.try_get("bugzilla_id")?,
                url: row.try_get("url")?,
                title: row.try_get("title")?,
            });
        }
    }

    for row in fetch_children(
        conn,
        dialect,
        "SELECT advisory_id, cpe FROM cpes",
        "advisory_id",
        &advisory_ids,
        None,
    )
    .await?
    {
        let advisory_id: i64 = row.try_get("advisory_id")?;
        if let Some((_, advisory)) = by_advisory.get_mut(&advisory_id) {
            advisory.affected_cpe_list.push(Cpe {
                cpe: row.try_get("cpe")?,
            });
        }
    }

    Ok(by_advisory.into_values().collect())
}

/// Run `select WHERE key IN (ids) [AND column = value] ORDER BY id`.
async fn fetch_children(
    conn: &mut AnyConnection,
    dialect: Dialect,
    select: &str,
    key: &str,
    ids: &[Value],
    extra: Option<(&str, Value)>,
) -> Result<Vec<sqlx::any::AnyRow>> {
    let mut sql = format!("{select} WHERE {key} IN ({})", in_list(ids.len()));
    let mut values = ids.to_vec();
    if let Some((column, value)) = extra {
        sql.push_str(&format!(" AND {column} = ?"));
        values.push(value);
    }
    sql.push_str(" ORDER BY id");

    Ok(bind_values(sqlx::query(&dialect.rebind(&sql)), &values)
        .fetch_all(&mut *conn)
        .await?)
}
