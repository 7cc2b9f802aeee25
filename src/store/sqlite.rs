use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use tokio::task;
use tracing::debug;
use uuid::Uuid;

use super::{
    CollectionDef, CollectionHandle, CompositeDef, CompositeEntity, CompositeQuery, FieldFilter,
    IndexDef, IndexKind, ItemStore, RelatedItemsGroup, RelationEdges, VersionAttributes,
    VersionHandle, COLLECTION_ITEM_CLASS, COMPOSITE_ITEM_CLASS,
};
use crate::error::StoreError;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS named_items (
        item_id TEXT PRIMARY KEY,
        item_class TEXT NOT NULL,
        name TEXT NOT NULL,
        short_name TEXT NOT NULL,
        description TEXT NOT NULL,
        user_type TEXT NOT NULL,
        namespaces_json TEXT NOT NULL,
        tip_version INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS item_versions (
        version_id TEXT PRIMARY KEY,
        item_id TEXT NOT NULL,
        version_no INTEGER NOT NULL,
        attributes_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (item_id, version_no)
    );
    CREATE TABLE IF NOT EXISTS related_collections (
        composite_id TEXT NOT NULL,
        collection_id TEXT NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (composite_id, collection_id)
    );
    CREATE TABLE IF NOT EXISTS collection_indexes (
        collection_id TEXT NOT NULL,
        index_name TEXT NOT NULL,
        field TEXT NOT NULL,
        kind TEXT NOT NULL,
        default_language TEXT NOT NULL,
        PRIMARY KEY (collection_id, index_name)
    );
    CREATE TABLE IF NOT EXISTS items (
        collection_id TEXT NOT NULL,
        version_no INTEGER NOT NULL,
        item_id TEXT NOT NULL,
        doc_json TEXT NOT NULL,
        PRIMARY KEY (collection_id, version_no, item_id)
    );
    CREATE TABLE IF NOT EXISTS related_items (
        parent_collection_id TEXT NOT NULL,
        parent_version_no INTEGER NOT NULL,
        parent_item_id TEXT NOT NULL,
        child_collection_id TEXT NOT NULL,
        child_version_no INTEGER NOT NULL,
        child_item_id TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS relations (
        parent_collection_id TEXT NOT NULL,
        parent_version_no INTEGER NOT NULL,
        parent_item_id TEXT NOT NULL,
        child_collection_id TEXT NOT NULL,
        child_version_no INTEGER NOT NULL,
        child_item_id TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_named_items_type ON named_items(item_class, user_type);
    CREATE INDEX IF NOT EXISTS idx_item_versions_item ON item_versions(item_id, version_no);
    CREATE INDEX IF NOT EXISTS idx_related_items_parent ON related_items(parent_collection_id, parent_item_id);
    CREATE INDEX IF NOT EXISTS idx_relations_parent ON relations(parent_collection_id, parent_item_id);
";

#[derive(Clone)]
pub struct SqliteItemStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteItemStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Task("sqlite connection lock poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
    }
}

fn tip_version(conn: &Connection, item_id: &str) -> Result<u32, StoreError> {
    conn.query_row(
        "SELECT tip_version FROM named_items WHERE item_id=?1",
        params![item_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("named item", item_id))
}

#[allow(clippy::too_many_arguments)]
fn insert_named_item(
    conn: &Connection,
    item_class: &str,
    name: &str,
    short_name: &str,
    description: &str,
    user_type: &str,
    namespaces: &[String],
    attributes: &VersionAttributes,
) -> Result<(String, String), StoreError> {
    let item_id = Uuid::new_v4().to_string();
    let version_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO named_items(item_id,item_class,name,short_name,description,user_type,namespaces_json,tip_version,created_at) VALUES(?1,?2,?3,?4,?5,?6,?7,1,?8)",
        params![
            item_id,
            item_class,
            name,
            short_name,
            description,
            user_type,
            serde_json::to_string(namespaces)?,
            now
        ],
    )?;
    conn.execute(
        "INSERT INTO item_versions(version_id,item_id,version_no,attributes_json,created_at) VALUES(?1,?2,1,?3,?4)",
        params![version_id, item_id, attributes.to_string(), now],
    )?;
    Ok((item_id, version_id))
}

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionHandle> {
    Ok(CollectionHandle {
        id: row.get(0)?,
        name: row.get(1)?,
        short_name: row.get(2)?,
        user_type: row.get(3)?,
        version_no: row.get(4)?,
    })
}

fn load_composite(conn: &Connection, item_id: &str) -> Result<CompositeEntity, StoreError> {
    let row = conn
        .query_row(
            "SELECT n.item_id, n.name, n.user_type, v.version_id, v.version_no, v.attributes_json
             FROM named_items n JOIN item_versions v ON v.item_id = n.item_id AND v.version_no = n.tip_version
             WHERE n.item_id=?1 AND n.item_class=?2",
            params![item_id, COMPOSITE_ITEM_CLASS],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::not_found("composite", item_id))?;

    Ok(CompositeEntity {
        id: row.0,
        name: row.1,
        user_type: row.2,
        version_id: row.3,
        version_no: row.4,
        version_attributes: serde_json::from_str(&row.5)?,
    })
}

fn item_exists(
    conn: &Connection,
    collection_id: &str,
    version_no: u32,
    item_id: &str,
) -> Result<bool, StoreError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM items WHERE collection_id=?1 AND version_no=?2 AND item_id=?3",
            params![collection_id, version_no, item_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn item_id_of(item: &Value) -> String {
    item.get("_id")
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn value_at_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, segment| node.get(segment))
}

fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', ""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: SqlValue) -> Option<Value> {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => None,
        SqlValue::Integer(i) => Some(json!(i)),
        SqlValue::Real(f) => Some(json!(f)),
        SqlValue::Text(s) => Some(Value::String(s)),
    }
}

fn physical_index_sql(field: &str) -> Option<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(format!(
        "CREATE INDEX IF NOT EXISTS idx_items_field_{field} ON items(collection_id, version_no, json_extract(doc_json, '$.{field}'))"
    ))
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn create_collection(&self, def: &CollectionDef) -> Result<CollectionHandle, StoreError> {
        let def = def.clone();
        self.with_conn(move |conn| {
            let (item_id, _) = insert_named_item(
                conn,
                COLLECTION_ITEM_CLASS,
                &def.name,
                &def.short_name,
                &def.description,
                &def.user_type,
                &def.namespaces,
                &json!({}),
            )?;
            debug!(collection_id = %item_id, user_type = %def.user_type, "Collection created");
            Ok(CollectionHandle {
                id: item_id,
                name: def.name,
                short_name: def.short_name,
                user_type: def.user_type,
                version_no: 1,
            })
        })
        .await
    }

    async fn create_or_recreate_index(
        &self,
        collection_id: &str,
        indexes: &[IndexDef],
    ) -> Result<(), StoreError> {
        let collection_id = collection_id.to_string();
        let indexes = indexes.to_vec();
        self.with_conn(move |conn| {
            tip_version(conn, &collection_id)?;
            let tx = conn.transaction()?;
            for index in &indexes {
                let kind = match index.kind {
                    IndexKind::Ascending => "ascending",
                    IndexKind::Text => "text",
                };
                tx.execute(
                    "INSERT OR REPLACE INTO collection_indexes(collection_id,index_name,field,kind,default_language) VALUES(?1,?2,?3,?4,?5)",
                    params![collection_id, index.name, index.field, kind, index.default_language],
                )?;
                if let Some(sql) = physical_index_sql(&index.field) {
                    tx.execute_batch(&sql)?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_named_composite(
        &self,
        def: &CompositeDef,
    ) -> Result<CompositeEntity, StoreError> {
        let def = def.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let (item_id, _) = insert_named_item(
                &tx,
                COMPOSITE_ITEM_CLASS,
                &def.name,
                &def.short_name,
                &def.description,
                &def.user_type,
                &def.namespaces,
                &def.version_attributes,
            )?;
            let entity = load_composite(&tx, &item_id)?;
            tx.commit()?;
            Ok(entity)
        })
        .await
    }

    async fn create_version(&self, item_id: &str) -> Result<VersionHandle, StoreError> {
        let item_id = item_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let tip = tip_version(&tx, &item_id)?;
            let attributes: String = tx.query_row(
                "SELECT attributes_json FROM item_versions WHERE item_id=?1 AND version_no=?2",
                params![item_id, tip],
                |row| row.get(0),
            )?;
            let next = tip + 1;
            let version_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO item_versions(version_id,item_id,version_no,attributes_json,created_at) VALUES(?1,?2,?3,?4,?5)",
                params![version_id, item_id, next, attributes, Utc::now().to_rfc3339()],
            )?;
            tx.execute(
                "UPDATE named_items SET tip_version=?1 WHERE item_id=?2",
                params![next, item_id],
            )?;
            tx.commit()?;
            Ok(VersionHandle {
                item_id,
                version_id,
                version_no: next,
            })
        })
        .await
    }

    async fn update_version_attributes(
        &self,
        item_id: &str,
        version_id: &str,
        attributes: &VersionAttributes,
    ) -> Result<(), StoreError> {
        let item_id = item_id.to_string();
        let version_id = version_id.to_string();
        let attributes = attributes.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE item_versions SET attributes_json=?1 WHERE item_id=?2 AND version_id=?3",
                params![attributes, item_id, version_id],
            )?;
            if updated == 0 {
                return Err(StoreError::not_found("version", version_id));
            }
            Ok(())
        })
        .await
    }

    async fn query_composites(
        &self,
        query: &CompositeQuery,
    ) -> Result<Vec<CompositeEntity>, StoreError> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT n.item_id, v.attributes_json
                 FROM named_items n JOIN item_versions v ON v.item_id = n.item_id
                 WHERE n.item_class=?1 AND n.user_type=?2
                 ORDER BY n.created_at, n.item_id, v.version_no",
            )?;
            let rows = stmt
                .query_map(params![COMPOSITE_ITEM_CLASS, query.user_type], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut matched: Vec<String> = Vec::new();
            for (item_id, attributes_json) in rows {
                if matched.contains(&item_id) {
                    continue;
                }
                let attributes: Value = serde_json::from_str(&attributes_json)?;
                if value_at_path(&attributes, &query.attribute_path) == Some(&query.value) {
                    matched.push(item_id);
                }
            }

            matched
                .iter()
                .map(|item_id| load_composite(conn, item_id))
                .collect()
        })
        .await
    }

    async fn collections_in_composite(
        &self,
        composite_id: &str,
    ) -> Result<Vec<CollectionHandle>, StoreError> {
        let composite_id = composite_id.to_string();
        self.with_conn(move |conn| {
            tip_version(conn, &composite_id)?;
            let mut stmt = conn.prepare(
                "SELECT n.item_id, n.name, n.short_name, n.user_type, n.tip_version
                 FROM related_collections r JOIN named_items n ON n.item_id = r.collection_id
                 WHERE r.composite_id=?1 ORDER BY r.position",
            )?;
            let handles = stmt
                .query_map(params![composite_id], collection_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(handles)
        })
        .await
    }

    async fn related_collection_ids(&self, composite_id: &str) -> Result<Vec<String>, StoreError> {
        let composite_id = composite_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT collection_id FROM related_collections WHERE composite_id=?1 ORDER BY position",
            )?;
            let ids = stmt
                .query_map(params![composite_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn add_related_collections(
        &self,
        composite_id: &str,
        collection_ids: &[String],
    ) -> Result<(), StoreError> {
        let composite_id = composite_id.to_string();
        let collection_ids = collection_ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            load_composite(&tx, &composite_id)?;
            tx.execute(
                "DELETE FROM related_collections WHERE composite_id=?1",
                params![composite_id],
            )?;
            for (position, collection_id) in collection_ids.iter().enumerate() {
                tip_version(&tx, collection_id)?;
                tx.execute(
                    "INSERT OR IGNORE INTO related_collections(composite_id,collection_id,position) VALUES(?1,?2,?3)",
                    params![composite_id, collection_id, position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_items_bulk(
        &self,
        collection_id: &str,
        items: &[Value],
    ) -> Result<usize, StoreError> {
        let collection_id = collection_id.to_string();
        let items = items.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let tip = tip_version(&tx, &collection_id)?;
            for item in &items {
                tx.execute(
                    "INSERT INTO items(collection_id,version_no,item_id,doc_json) VALUES(?1,?2,?3,?4)",
                    params![collection_id, tip, item_id_of(item), item.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(items.len())
        })
        .await
    }

    async fn create_items_as_related_bulk(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        groups: &[RelatedItemsGroup],
    ) -> Result<usize, StoreError> {
        let parent_collection_id = parent_collection_id.to_string();
        let child_collection_id = child_collection_id.to_string();
        let groups = groups.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let parent_tip = tip_version(&tx, &parent_collection_id)?;
            let child_tip = tip_version(&tx, &child_collection_id)?;
            let mut written = 0;
            for group in &groups {
                if !item_exists(&tx, &parent_collection_id, parent_tip, &group.parent_item_id)? {
                    return Err(StoreError::not_found("item", group.parent_item_id.clone()));
                }
                for item in &group.items {
                    let child_item_id = item_id_of(item);
                    tx.execute(
                        "INSERT INTO items(collection_id,version_no,item_id,doc_json) VALUES(?1,?2,?3,?4)",
                        params![child_collection_id, child_tip, child_item_id, item.to_string()],
                    )?;
                    tx.execute(
                        "INSERT INTO related_items(parent_collection_id,parent_version_no,parent_item_id,child_collection_id,child_version_no,child_item_id) VALUES(?1,?2,?3,?4,?5,?6)",
                        params![
                            parent_collection_id,
                            parent_tip,
                            group.parent_item_id,
                            child_collection_id,
                            child_tip,
                            child_item_id
                        ],
                    )?;
                    written += 1;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn create_relations(
        &self,
        parent_collection_id: &str,
        child_collection_id: &str,
        relations: &[RelationEdges],
    ) -> Result<usize, StoreError> {
        let parent_collection_id = parent_collection_id.to_string();
        let child_collection_id = child_collection_id.to_string();
        let relations = relations.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let parent_tip = tip_version(&tx, &parent_collection_id)?;
            let child_tip = tip_version(&tx, &child_collection_id)?;
            let mut written = 0;
            for relation in &relations {
                if !item_exists(&tx, &parent_collection_id, parent_tip, &relation.parent_item_id)? {
                    return Err(StoreError::not_found("item", relation.parent_item_id.clone()));
                }
                for child_item_id in &relation.child_item_ids {
                    if !item_exists(&tx, &child_collection_id, child_tip, child_item_id)? {
                        return Err(StoreError::not_found("item", child_item_id.clone()));
                    }
                    tx.execute(
                        "INSERT INTO relations(parent_collection_id,parent_version_no,parent_item_id,child_collection_id,child_version_no,child_item_id) VALUES(?1,?2,?3,?4,?5,?6)",
                        params![
                            parent_collection_id,
                            parent_tip,
                            relation.parent_item_id,
                            child_collection_id,
                            child_tip,
                            child_item_id
                        ],
                    )?;
                    written += 1;
                }
            }
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn distinct_values(
        &self,
        collection_id: &str,
        field: &str,
        filter: Option<&FieldFilter>,
    ) -> Result<Vec<Value>, StoreError> {
        let collection_id = collection_id.to_string();
        let path = json_path(field);
        let filter = filter.map(|f| (json_path(&f.field), to_sql(&f.value)));
        self.with_conn(move |conn| {
            let tip = tip_version(conn, &collection_id)?;
            let values = match filter {
                Some((filter_path, filter_value)) => {
                    let mut stmt = conn.prepare(
                        "SELECT json_extract(doc_json, ?1) AS v, MIN(rowid) AS first FROM items
                         WHERE collection_id=?2 AND version_no=?3 AND json_extract(doc_json, ?4) = ?5
                         GROUP BY v ORDER BY first",
                    )?;
                    let rows = stmt
                        .query_map(
                            params![path, collection_id, tip, filter_path, filter_value],
                            |row| row.get::<_, SqlValue>(0),
                        )?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT json_extract(doc_json, ?1) AS v, MIN(rowid) AS first FROM items
                         WHERE collection_id=?2 AND version_no=?3
                         GROUP BY v ORDER BY first",
                    )?;
                    let rows = stmt
                        .query_map(params![path, collection_id, tip], |row| {
                            row.get::<_, SqlValue>(0)
                        })?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(values.into_iter().filter_map(from_sql).collect())
        })
        .await
    }

    async fn distinct_grouped(
        &self,
        collection_id: &str,
        key_field: &str,
        value_field: &str,
    ) -> Result<Option<BTreeMap<String, Vec<Value>>>, StoreError> {
        let collection_id = collection_id.to_string();
        let key_path = json_path(key_field);
        let value_path = json_path(value_field);
        self.with_conn(move |conn| {
            let tip = tip_version(conn, &collection_id)?;
            let mut stmt = conn.prepare(
                "SELECT json_extract(doc_json, ?1) AS k, json_extract(doc_json, ?2) AS v, MIN(rowid) AS first
                 FROM items WHERE collection_id=?3 AND version_no=?4
                 GROUP BY k, v ORDER BY first",
            )?;
            let rows = stmt
                .query_map(params![key_path, value_path, collection_id, tip], |row| {
                    Ok((row.get::<_, SqlValue>(0)?, row.get::<_, SqlValue>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            for (key, value) in rows {
                let key = match from_sql(key) {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => continue,
                };
                let entry = grouped.entry(key).or_default();
                if let Some(value) = from_sql(value) {
                    entry.push(value);
                }
            }
            Ok(Some(grouped))
        })
        .await
    }
}

#[cfg(test)]
impl SqliteItemStore {
    fn count(&self, sql: &str, arg: &str) -> usize {
        let conn = self.conn.lock().unwrap();
        conn.query_row(sql, params![arg], |row| row.get::<_, i64>(0))
            .unwrap() as usize
    }

    pub fn named_item_count(&self, item_class: &str) -> usize {
        self.count(
            "SELECT COUNT(*) FROM named_items WHERE item_class=?1",
            item_class,
        )
    }

    pub fn item_count(&self, collection_id: &str) -> usize {
        self.count(
            "SELECT COUNT(*) FROM items i JOIN named_items n ON n.item_id = i.collection_id
             WHERE i.collection_id=?1 AND i.version_no = n.tip_version",
            collection_id,
        )
    }

    pub fn related_group_count(&self, child_collection_id: &str) -> usize {
        self.count(
            "SELECT COUNT(DISTINCT parent_item_id) FROM related_items r JOIN named_items n ON n.item_id = r.child_collection_id
             WHERE r.child_collection_id=?1 AND r.child_version_no = n.tip_version",
            child_collection_id,
        )
    }

    pub fn relation_pairs(&self, parent_collection_id: &str) -> Vec<(String, String)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT r.parent_item_id, r.child_item_id FROM relations r JOIN named_items n ON n.item_id = r.parent_collection_id
                 WHERE r.parent_collection_id=?1 AND r.parent_version_no = n.tip_version ORDER BY r.rowid",
            )
            .unwrap();
        stmt.query_map(params![parent_collection_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    pub fn index_names(&self, collection_id: &str) -> Vec<String> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT index_name FROM collection_indexes WHERE collection_id=?1 ORDER BY index_name")
            .unwrap();
        stmt.query_map(params![collection_id], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap()
    }

    pub fn version_count(&self, item_id: &str) -> usize {
        self.count("SELECT COUNT(*) FROM item_versions WHERE item_id=?1", item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection_def(user_type: &str) -> CollectionDef {
        CollectionDef {
            name: format!("model_{user_type}"),
            short_name: format!("m_{user_type}"),
            description: "test collection".to_string(),
            user_type: user_type.to_string(),
            namespaces: vec!["ns".to_string()],
        }
    }

    fn composite_def(file_id: &str) -> CompositeDef {
        CompositeDef {
            name: "model".to_string(),
            short_name: "model_ver".to_string(),
            description: "model".to_string(),
            user_type: "bim_model_version".to_string(),
            namespaces: vec!["ns".to_string()],
            version_attributes: json!({"bimpk": {"fileId": file_id, "fileVersionId": "v1"}}),
        }
    }

    #[tokio::test]
    async fn items_land_in_the_current_version_only() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let coll = store.create_collection(&collection_def("rvt_elements")).await.unwrap();

        store
            .create_items_bulk(&coll.id, &[json!({"_id": "a", "source_filename": "x.rvt"})])
            .await
            .unwrap();
        assert_eq!(store.item_count(&coll.id), 1);

        let version = store.create_version(&coll.id).await.unwrap();
        assert_eq!(version.version_no, 2);
        assert_eq!(store.item_count(&coll.id), 0);

        store
            .create_items_bulk(
                &coll.id,
                &[
                    json!({"_id": "a", "source_filename": "y.rvt"}),
                    json!({"_id": "b", "source_filename": "y.rvt"}),
                ],
            )
            .await
            .unwrap();
        let names = store
            .distinct_values(&coll.id, "source_filename", None)
            .await
            .unwrap();
        assert_eq!(names, vec![json!("y.rvt")]);
    }

    #[tokio::test]
    async fn composites_match_on_any_version_attribute() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let entity = store.create_named_composite(&composite_def("f-1")).await.unwrap();
        store.create_named_composite(&composite_def("f-2")).await.unwrap();

        let query = CompositeQuery {
            user_type: "bim_model_version".to_string(),
            attribute_path: "bimpk.fileId".to_string(),
            value: json!("f-1"),
        };
        let found = store.query_composites(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, entity.id);

        let version = store.create_version(&entity.id).await.unwrap();
        store
            .update_version_attributes(
                &entity.id,
                &version.version_id,
                &json!({"bimpk": {"fileId": "f-1", "fileVersionId": "v2"}}),
            )
            .await
            .unwrap();

        let found = store.query_composites(&query).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version_no, 2);
        assert_eq!(found[0].version_attributes["bimpk"]["fileVersionId"], "v2");
    }

    #[tokio::test]
    async fn related_collections_are_replaced_not_appended() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let entity = store.create_named_composite(&composite_def("f-1")).await.unwrap();
        let a = store.create_collection(&collection_def("a")).await.unwrap();
        let b = store.create_collection(&collection_def("b")).await.unwrap();

        let ids = vec![a.id.clone(), b.id.clone()];
        store.add_related_collections(&entity.id, &ids).await.unwrap();
        store.add_related_collections(&entity.id, &ids).await.unwrap();

        assert_eq!(store.related_collection_ids(&entity.id).await.unwrap(), ids);
        let handles = store.collections_in_composite(&entity.id).await.unwrap();
        assert_eq!(handles, vec![a, b]);
    }

    #[tokio::test]
    async fn recreating_an_identical_index_succeeds() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let coll = store.create_collection(&collection_def("rvt_elements")).await.unwrap();
        let defs = vec![
            IndexDef::ascending("model_els_coll_id", "id"),
            IndexDef::ascending("model_els_coll_source_id", "source_id"),
        ];
        store.create_or_recreate_index(&coll.id, &defs).await.unwrap();
        store.create_or_recreate_index(&coll.id, &defs).await.unwrap();
        assert_eq!(
            store.index_names(&coll.id),
            vec!["model_els_coll_id", "model_els_coll_source_id"]
        );
    }

    #[tokio::test]
    async fn relations_require_existing_items() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let parents = store.create_collection(&collection_def("p")).await.unwrap();
        let children = store.create_collection(&collection_def("c")).await.unwrap();
        store
            .create_items_bulk(&parents.id, &[json!({"_id": "p1"})])
            .await
            .unwrap();

        let err = store
            .create_relations(
                &parents.id,
                &children.id,
                &[RelationEdges {
                    parent_item_id: "p1".to_string(),
                    child_item_ids: vec!["missing".to_string()],
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "item", .. }));
        assert!(store.relation_pairs(&parents.id).is_empty());
    }

    #[tokio::test]
    async fn filtered_and_grouped_distinct_values_agree() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let coll = store.create_collection(&collection_def("rvt_elements")).await.unwrap();
        store
            .create_items_bulk(
                &coll.id,
                &[
                    json!({"source_filename": "a.rvt", "package_id": 1}),
                    json!({"source_filename": "a.rvt", "package_id": 2}),
                    json!({"source_filename": "b.rvt", "package_id": "x"}),
                    json!({"source_filename": "a.rvt", "package_id": 1}),
                ],
            )
            .await
            .unwrap();

        let filter = FieldFilter {
            field: "source_filename".to_string(),
            value: json!("a.rvt"),
        };
        let a_ids = store
            .distinct_values(&coll.id, "package_id", Some(&filter))
            .await
            .unwrap();
        assert_eq!(a_ids, vec![json!(1), json!(2)]);

        let grouped = store
            .distinct_grouped(&coll.id, "source_filename", "package_id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grouped["a.rvt"], a_ids);
        assert_eq!(grouped["b.rvt"], vec![json!("x")]);
    }

    #[tokio::test]
    async fn unknown_collection_is_not_found() {
        let store = SqliteItemStore::open_in_memory().unwrap();
        let err = store.create_items_bulk("nope", &[json!({})]).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
