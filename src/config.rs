//! 配置模块，负责从JSON文件加载额外的字段映射

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::registry::FieldSpec;
use crate::sql_compiler::CompilerConfig;

/// 字段映射配置结构
///
/// ```json
/// {"plan": {"column": "custom_string_1", "type": "string"}}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMappingConfig {
    /// 字段名到列定义的映射
    #[serde(flatten)]
    pub fields: HashMap<String, FieldSpec>,
}

impl FieldMappingConfig {
    /// 从JSON文件加载字段映射配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::NotFound(path_ref.to_path_buf()));
        }

        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.to_path_buf(),
            source,
        })?;

        let fields: HashMap<String, FieldSpec> =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path_ref.to_path_buf(),
                source,
            })?;

        Ok(FieldMappingConfig { fields })
    }

    /// 获取所有映射
    pub fn get_mappings(&self) -> &HashMap<String, FieldSpec> {
        &self.fields
    }

    /// 转换为编译器配置，其余选项使用默认值
    pub fn into_compiler_config(self) -> CompilerConfig {
        CompilerConfig {
            field_mapping: self.fields,
            ..Default::default()
        }
    }
}
