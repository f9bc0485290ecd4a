// 该文件是 WarTrace 项目的一部分。
// src/store/repository.rs - 数据读写
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ffi, params};

use crate::model::BoundingBox;
use crate::store::StoreError;
use crate::store::records::{
  ClassificationRow, ContentItem, Detection, DetectorFlags, MediaFile, NewDetection,
  ObjectDetectionRow, SegmentationMaskRow,
};

const ITEM_COLUMNS: &str = "id, title, object_detection, military_detection, damage_assessment, emergency_recognition, created_at";
const DETECTION_COLUMNS: &str =
  "id, media_file_id, detector_type, model_name, summary, result_path, created_at, updated_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<ContentItem> {
  Ok(ContentItem {
    id: row.get(0)?,
    title: row.get(1)?,
    flags: DetectorFlags {
      object_detection: row.get(2)?,
      military_detection: row.get(3)?,
      damage_assessment: row.get(4)?,
      emergency_recognition: row.get(5)?,
    },
    created_at: row.get(6)?,
  })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<MediaFile> {
  let path: String = row.get(2)?;
  Ok(MediaFile {
    id: row.get(0)?,
    item_id: row.get(1)?,
    path: PathBuf::from(path),
    uploaded_at: row.get(3)?,
  })
}

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
  Ok(Detection {
    id: row.get(0)?,
    media_file_id: row.get(1)?,
    detector_type: row.get(2)?,
    model_name: row.get(3)?,
    summary: row.get(4)?,
    result_path: row.get(5)?,
    created_at: row.get(6)?,
    updated_at: row.get(7)?,
  })
}

// ---- content_items ----

pub fn insert_content_item(
  conn: &Connection,
  title: &str,
  flags: &DetectorFlags,
  now: DateTime<Utc>,
) -> Result<i64, StoreError> {
  conn.execute(
    "INSERT INTO content_items (title, object_detection, military_detection, damage_assessment, emergency_recognition, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    params![
      title,
      flags.object_detection,
      flags.military_detection,
      flags.damage_assessment,
      flags.emergency_recognition,
      now,
    ],
  )?;
  Ok(conn.last_insert_rowid())
}

pub fn get_content_item(conn: &Connection, id: i64) -> Result<Option<ContentItem>, StoreError> {
  let item = conn
    .query_row(
      &format!("SELECT {ITEM_COLUMNS} FROM content_items WHERE id = ?1"),
      params![id],
      item_from_row,
    )
    .optional()?;
  Ok(item)
}

pub fn update_detector_flags(
  conn: &Connection,
  id: i64,
  flags: &DetectorFlags,
) -> Result<usize, StoreError> {
  let count = conn.execute(
    "UPDATE content_items
     SET object_detection = ?2, military_detection = ?3, damage_assessment = ?4, emergency_recognition = ?5
     WHERE id = ?1",
    params![
      id,
      flags.object_detection,
      flags.military_detection,
      flags.damage_assessment,
      flags.emergency_recognition,
    ],
  )?;
  Ok(count)
}

pub fn delete_content_item(conn: &Connection, id: i64) -> Result<usize, StoreError> {
  let count = conn.execute("DELETE FROM content_items WHERE id = ?1", params![id])?;
  Ok(count)
}

// ---- media_files ----

pub fn insert_media_file(
  conn: &Connection,
  item_id: i64,
  path: &Path,
  now: DateTime<Utc>,
) -> Result<i64, StoreError> {
  conn.execute(
    "INSERT INTO media_files (item_id, path, uploaded_at) VALUES (?1, ?2, ?3)",
    params![item_id, path.to_string_lossy().into_owned(), now],
  )?;
  Ok(conn.last_insert_rowid())
}

pub fn get_media_file(conn: &Connection, id: i64) -> Result<Option<MediaFile>, StoreError> {
  let file = conn
    .query_row(
      "SELECT id, item_id, path, uploaded_at FROM media_files WHERE id = ?1",
      params![id],
      file_from_row,
    )
    .optional()?;
  Ok(file)
}

/// 按 id 升序
pub fn list_media_files(conn: &Connection, item_id: i64) -> Result<Vec<MediaFile>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT id, item_id, path, uploaded_at FROM media_files WHERE item_id = ?1 ORDER BY id ASC",
  )?;
  let files = stmt
    .query_map(params![item_id], file_from_row)?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(files)
}

pub fn delete_media_file(conn: &Connection, id: i64) -> Result<usize, StoreError> {
  let count = conn.execute("DELETE FROM media_files WHERE id = ?1", params![id])?;
  Ok(count)
}

// ---- detections ----

pub fn list_detections(conn: &Connection, media_file_id: i64) -> Result<Vec<Detection>, StoreError> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {DETECTION_COLUMNS} FROM detections WHERE media_file_id = ?1 ORDER BY id ASC"
  ))?;
  let detections = stmt
    .query_map(params![media_file_id], detection_from_row)?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(detections)
}

pub fn get_detection(
  conn: &Connection,
  media_file_id: i64,
  detector_type: &str,
) -> Result<Option<Detection>, StoreError> {
  let detection = conn
    .query_row(
      &format!(
        "SELECT {DETECTION_COLUMNS} FROM detections WHERE media_file_id = ?1 AND detector_type = ?2"
      ),
      params![media_file_id, detector_type],
      detection_from_row,
    )
    .optional()?;
  Ok(detection)
}

pub fn count_detections(conn: &Connection) -> Result<i64, StoreError> {
  let count = conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?;
  Ok(count)
}

/// 插入检测主记录。(media_file_id, detector_type) 已存在时返回 `DuplicateDetection`。
pub fn insert_detection(
  conn: &Connection,
  new: &NewDetection,
  now: DateTime<Utc>,
) -> Result<i64, StoreError> {
  let inserted = conn.execute(
    "INSERT INTO detections (media_file_id, detector_type, model_name, summary, result_path, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
    params![
      new.media_file_id,
      new.detector_type,
      new.model_name,
      new.summary,
      new.result_path,
      now,
    ],
  );

  match inserted {
    Ok(_) => Ok(conn.last_insert_rowid()),
    Err(rusqlite::Error::SqliteFailure(e, _)) if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE => {
      Err(StoreError::DuplicateDetection {
        media_file_id: new.media_file_id,
        detector_type: new.detector_type.clone(),
      })
    }
    Err(e) => Err(e.into()),
  }
}

/// 写入一条检测的全部子记录
pub fn insert_children(
  conn: &Connection,
  detection_id: i64,
  new: &NewDetection,
) -> Result<(), StoreError> {
  if !new.objects.is_empty() {
    let mut stmt = conn.prepare(
      "INSERT INTO object_detections (detection_id, label, confidence, x_min, y_min, x_max, y_max)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for object in &new.objects {
      stmt.execute(params![
        detection_id,
        object.label,
        object.confidence as f64,
        object.bbox.x_min as f64,
        object.bbox.y_min as f64,
        object.bbox.x_max as f64,
        object.bbox.y_max as f64,
      ])?;
    }
  }

  if !new.classifications.is_empty() {
    let mut stmt = conn.prepare(
      "INSERT INTO classification_results (detection_id, label, confidence) VALUES (?1, ?2, ?3)",
    )?;
    for score in &new.classifications {
      stmt.execute(params![detection_id, score.label, score.confidence as f64])?;
    }
  }

  if !new.masks.is_empty() {
    let mut stmt = conn.prepare(
      "INSERT INTO segmentation_masks (detection_id, label, mask_path, confidence, metadata)
       VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for mask in &new.masks {
      stmt.execute(params![
        detection_id,
        mask.label,
        mask.mask_path,
        mask.confidence as f64,
        mask.metadata,
      ])?;
    }
  }

  Ok(())
}

// ---- 子记录查询 ----

pub fn list_object_detections(
  conn: &Connection,
  detection_id: i64,
) -> Result<Vec<ObjectDetectionRow>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT id, detection_id, label, confidence, x_min, y_min, x_max, y_max, metadata
     FROM object_detections WHERE detection_id = ?1 ORDER BY confidence DESC, id ASC",
  )?;
  let rows = stmt
    .query_map(params![detection_id], |row| {
      Ok(ObjectDetectionRow {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        label: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
        bbox: BoundingBox {
          x_min: row.get::<_, f64>(4)? as f32,
          y_min: row.get::<_, f64>(5)? as f32,
          x_max: row.get::<_, f64>(6)? as f32,
          y_max: row.get::<_, f64>(7)? as f32,
        },
        metadata: row.get(8)?,
      })
    })?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(rows)
}

/// 按插入顺序读出，第一条为选中的类别。
/// 二分类阈值不为 0.5 时选中类别的置信度可能低于另一类，不能按置信度排序。
pub fn list_classifications(
  conn: &Connection,
  detection_id: i64,
) -> Result<Vec<ClassificationRow>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT id, detection_id, label, confidence, metadata
     FROM classification_results WHERE detection_id = ?1 ORDER BY id ASC",
  )?;
  let rows = stmt
    .query_map(params![detection_id], |row| {
      Ok(ClassificationRow {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        label: row.get(2)?,
        confidence: row.get::<_, f64>(3)? as f32,
        metadata: row.get(4)?,
      })
    })?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(rows)
}

pub fn list_segmentation_masks(
  conn: &Connection,
  detection_id: i64,
) -> Result<Vec<SegmentationMaskRow>, StoreError> {
  let mut stmt = conn.prepare(
    "SELECT id, detection_id, label, mask_path, confidence, metadata
     FROM segmentation_masks WHERE detection_id = ?1 ORDER BY id ASC",
  )?;
  let rows = stmt
    .query_map(params![detection_id], |row| {
      Ok(SegmentationMaskRow {
        id: row.get(0)?,
        detection_id: row.get(1)?,
        label: row.get(2)?,
        mask_path: row.get(3)?,
        confidence: row.get::<_, f64>(4)? as f32,
        metadata: row.get(5)?,
      })
    })?
    .collect::<Result<Vec<_>, _>>()?;
  Ok(rows)
}
