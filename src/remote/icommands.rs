//! 通过 icommands 命令行工具访问 iRODS
//!
//! 每个操作启动一个子进程。调用方的超时取消 future 时子进程随之被杀掉。

use super::{Children, RemoteError, RemoteObject, Repository};
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// `ils -L` 中的数据对象行
const OBJECT_LINE: &str = r"^  (?P<owner>\S+)\s+(?P<replica>\d+)\s+(?P<resource>\S+)\s+(?P<size>\d+)\s+(?P<date>\d{4}-\d{2}-\d{2}\.\d{2}:\d{2})\s+(?:(?P<status>[&X])\s+)?(?P<name>.+)$";

/// `ils -L` 中的子集合行
const COLLECTION_LINE: &str = r"^\s+C- (?P<path>/.*)$";

/// `ils -L` 输出解析器
pub(crate) struct ListingParser {
    object_line: Regex,
    collection_line: Regex,
}

pub struct IcommandsRepository {
    default_resource: Option<String>,
    name: String,
    parser: ListingParser,
}

impl IcommandsRepository {
    pub fn new(default_resource: Option<String>) -> Result<Self, RemoteError> {
        let name = match &default_resource {
            Some(r) => format!("irods(icommands, {})", r),
            None => "irods(icommands)".to_string(),
        };
        let parser = ListingParser::new()
            .map_err(|e| RemoteError::Unknown(format!("ils 输出解析规则无效: {}", e)))?;
        Ok(Self {
            default_resource,
            name,
            parser,
        })
    }

    /// 运行一个 icommand，返回标准输出
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, RemoteError> {
        debug!("执行: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    RemoteError::Unknown(format!("找不到 icommands 程序 {}, 请确认已安装", program))
                } else {
                    RemoteError::Unknown(format!("启动 {} 失败: {}", program, e))
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = format!("{} {}: {}{}", program, args.join(" "), stderr.trim(), stdout.trim());
        Err(classify_failure(&message))
    }

    /// `ils` 查看路径，返回第一行（集合为 `<path>:`）
    async fn probe(&self, path: &str) -> Result<Option<String>, RemoteError> {
        match self.run("ils", &[path]).await {
            Ok(out) => Ok(out.lines().next().map(|l| l.trim().to_string())),
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// 根据错误输出归类失败原因
pub(crate) fn classify_failure(message: &str) -> RemoteError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("does not exist")
        || message.contains("-310000")
        || message.contains("CAT_NO_ROWS_FOUND")
        || message.contains("USER_FILE_DOES_NOT_EXIST")
    {
        RemoteError::NotFound(message.to_string())
    } else if message.contains("CAT_NO_ACCESS_PERMISSION")
        || message.contains("-818000")
        || lower.contains("permission denied")
    {
        RemoteError::PermissionDenied(message.to_string())
    } else if message.contains("SYS_SOCK")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
    {
        RemoteError::NetworkTimeout(message.to_string())
    } else {
        RemoteError::Unknown(message.to_string())
    }
}

impl ListingParser {
    pub(crate) fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            object_line: Regex::new(OBJECT_LINE)?,
            collection_line: Regex::new(COLLECTION_LINE)?,
        })
    }

    /// 解析 `ils -L <collection>` 的输出
    ///
    /// 每个副本一行，后面跟一行 `<checksum> <数据类型> <物理路径>`，
    /// 没有校验和时第一列缺失。同名对象的多个副本只保留一个。
    pub(crate) fn parse_long_listing(&self, output: &str) -> Children {
        let mut children = Children::default();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut current: Option<usize> = None;

        for line in output.lines() {
            if let Some(caps) = self.collection_line.captures(line) {
                children.collections.push(caps["path"].trim_end().to_string());
                current = None;
                continue;
            }

            if let Some(caps) = self.object_line.captures(line) {
                let name = caps["name"].to_string();
                let size = caps["size"].parse().unwrap_or(0);
                let idx = *index.entry(name.clone()).or_insert_with(|| {
                    children.objects.push(RemoteObject {
                        name,
                        size,
                        checksum: None,
                    });
                    children.objects.len() - 1
                });
                current = Some(idx);
                continue;
            }

            // 副本详情行：缩进四个空格
            if line.starts_with("    ") {
                if let Some(idx) = current.take() {
                    let tokens: Vec<&str> = line.split_whitespace().collect();
                    let has_checksum = tokens.len() >= 3 && !tokens[1].starts_with('/');
                    if has_checksum && children.objects[idx].checksum.is_none() {
                        children.objects[idx].checksum = Some(tokens[0].to_string());
                    }
                }
            }
        }

        children
    }
}

/// 解析 `ichksum` 的输出，返回描述符
pub(crate) fn parse_chksum_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Total") && !l.starts_with("C-"))
        .find_map(|l| {
            let mut tokens = l.split_whitespace();
            let last = tokens.next_back()?;
            // 至少要有 `<名称> <校验和>` 两列
            tokens.next()?;
            Some(last.to_string())
        })
}

/// 解析 iquest 查询的 RESC_FREE_SPACE，0 或空值表示资源没有设置
pub(crate) fn parse_free_space(output: &str) -> Option<u64> {
    let value = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    match value.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(v) => Some(v),
    }
}

#[async_trait]
impl Repository for IcommandsRepository {
    async fn list_children(&self, path: &str) -> Result<Children, RemoteError> {
        let output = self.run("ils", &["-L", path]).await?;
        let children = self.parser.parse_long_listing(&output);
        debug!(
            "列举 {}: {} 个子集合, {} 个对象",
            path,
            children.collections.len(),
            children.objects.len()
        );
        Ok(children)
    }

    async fn object_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let first = self.probe(path).await?;
        Ok(matches!(first, Some(line) if !line.ends_with(':')))
    }

    async fn collection_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let first = self.probe(path).await?;
        Ok(matches!(first, Some(line) if line.ends_with(':')))
    }

    async fn compute_checksum(&self, path: &str) -> Result<String, RemoteError> {
        let output = self.run("ichksum", &[path]).await?;
        parse_chksum_output(&output)
            .ok_or_else(|| RemoteError::Unknown(format!("无法解析 ichksum 输出: {}", output.trim())))
    }

    async fn create_collection(&self, path: &str) -> Result<(), RemoteError> {
        self.run("imkdir", &["-p", path]).await.map(|_| ())
    }

    async fn put(
        &self,
        local: &Path,
        remote: &str,
        resource: Option<&str>,
    ) -> Result<(), RemoteError> {
        let local_str = local.to_string_lossy();
        let resource = resource.or(self.default_resource.as_deref());
        let mut args = vec!["-f", "-K"];
        if let Some(resc) = resource {
            args.push("-R");
            args.push(resc);
        }
        args.push(local_str.as_ref());
        args.push(remote);
        self.run("iput", &args).await.map(|_| ())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), RemoteError> {
        let local_str = local.to_string_lossy();
        self.run("iget", &["-f", "-K", remote, local_str.as_ref()])
            .await
            .map(|_| ())
    }

    async fn free_space(&self, resource: Option<&str>) -> Result<Option<u64>, RemoteError> {
        let Some(resource) = resource.or(self.default_resource.as_deref()) else {
            warn!("没有指定存储资源, 无法查询剩余空间");
            return Ok(None);
        };
        let query = format!(
            "select RESC_FREE_SPACE where RESC_NAME = '{}'",
            resource.replace('\'', "")
        );
        match self.run("iquest", &["%s", &query]).await {
            Ok(output) => Ok(parse_free_space(&output)),
            // 没有查到资源时 iquest 以 CAT_NO_ROWS_FOUND 失败
            Err(RemoteError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "/tempZone/home/rods/coll:
  rods              0 demoResc           12 2024-03-01.10:15 & a.txt
    sha2:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=    generic    /var/lib/irods/Vault/home/rods/coll/a.txt
  rods              1 replResc           12 2024-03-01.10:15 & a.txt
    sha2:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=    generic    /var/lib/irods/repl/home/rods/coll/a.txt
  rods              0 demoResc          300 2024-03-02.08:00 & my file.bin
    generic    /var/lib/irods/Vault/home/rods/coll/my file.bin
  C- /tempZone/home/rods/coll/sub
  C- /tempZone/home/rods/coll/empty dir
";

    #[test]
    fn test_parse_long_listing() {
        let children = ListingParser::new().unwrap().parse_long_listing(LISTING);

        assert_eq!(children.objects.len(), 2);
        let a = &children.objects[0];
        assert_eq!(a.name, "a.txt");
        assert_eq!(a.size, 12);
        assert!(a.checksum.as_deref().unwrap().starts_with("sha2:"));

        let b = &children.objects[1];
        assert_eq!(b.name, "my file.bin");
        assert_eq!(b.size, 300);
        assert!(b.checksum.is_none());

        assert_eq!(
            children.collections,
            vec![
                "/tempZone/home/rods/coll/sub".to_string(),
                "/tempZone/home/rods/coll/empty dir".to_string()
            ]
        );
    }

    #[test]
    fn test_repository_name() {
        let repo = IcommandsRepository::new(Some("demoResc".to_string())).unwrap();
        assert_eq!(repo.name(), "irods(icommands, demoResc)");
        assert_eq!(IcommandsRepository::new(None).unwrap().name(), "irods(icommands)");
    }

    #[test]
    fn test_parse_chksum_output() {
        let out = "    a.txt    sha2:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=\nTotal checksum performed = 1, Failed checksum = 0\n";
        assert_eq!(
            parse_chksum_output(out).as_deref(),
            Some("sha2:LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=")
        );
        assert!(parse_chksum_output("Total checksum performed = 0\n").is_none());
    }

    #[test]
    fn test_parse_free_space() {
        assert_eq!(parse_free_space("123456\n"), Some(123456));
        assert_eq!(parse_free_space("0\n"), None);
        assert_eq!(parse_free_space("\n"), None);
        assert_eq!(parse_free_space(""), None);
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("ERROR: lsUtil: srcPath /x does not exist or user lacks access permission"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("status = -818000 CAT_NO_ACCESS_PERMISSION"),
            RemoteError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_failure("SYS_SOCK_READ_TIMEDOUT"),
            RemoteError::NetworkTimeout(_)
        ));
        assert!(matches!(
            classify_failure("something odd"),
            RemoteError::Unknown(_)
        ));
    }
}
