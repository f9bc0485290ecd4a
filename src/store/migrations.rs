// 该文件是 WarTrace 项目的一部分。
// src/store/migrations.rs - 数据库表结构
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

use rusqlite::Connection;

use crate::store::StoreError;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS content_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    object_detection BOOLEAN NOT NULL DEFAULT 0,
    military_detection BOOLEAN NOT NULL DEFAULT 0,
    damage_assessment BOOLEAN NOT NULL DEFAULT 0,
    emergency_recognition BOOLEAN NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS media_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES content_items(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    uploaded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_media_files_item ON media_files(item_id);

CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    media_file_id INTEGER NOT NULL REFERENCES media_files(id) ON DELETE CASCADE,
    detector_type TEXT NOT NULL,
    model_name TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    result_path TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (media_file_id, detector_type)
);

CREATE TABLE IF NOT EXISTS object_detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    detection_id INTEGER NOT NULL REFERENCES detections(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    x_min REAL NOT NULL,
    y_min REAL NOT NULL,
    x_max REAL NOT NULL,
    y_max REAL NOT NULL,
    metadata TEXT,
    CHECK (x_min <= x_max AND y_min <= y_max)
);

CREATE INDEX IF NOT EXISTS idx_object_detections_parent ON object_detections(detection_id);

CREATE TABLE IF NOT EXISTS classification_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    detection_id INTEGER NOT NULL REFERENCES detections(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_classification_results_parent ON classification_results(detection_id);

CREATE TABLE IF NOT EXISTS segmentation_masks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    detection_id INTEGER NOT NULL REFERENCES detections(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    mask_path TEXT NOT NULL,
    confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_segmentation_masks_parent ON segmentation_masks(detection_id);
";

pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
  // foreign_keys 是连接级设置，每次打开都要开启
  conn.execute_batch("PRAGMA foreign_keys = ON;")?;
  conn.execute_batch("PRAGMA journal_mode=WAL;")?;
  conn.execute_batch(SCHEMA_V1)?;
  Ok(())
}
