//! CLI 모듈
//!
//! feedrank CLI 명령어 정의 및 구현

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::cache::{ResponseCache, SqliteCacheBackend};
use crate::config::FeedrankConfig;
use crate::embedding::{has_api_key, EmbeddingProvider, GeminiEmbedding};
use crate::engine::{CacheLookup, DataPaths, RetrievalEngine};
use crate::feedback::{FeedbackEvent, FeedbackScope};
use crate::knowledge::{KnowledgeStore, LanceVectorStore, NewFragment, VectorEntry, VectorStore};
use crate::query::{query_key, RetrievalFlags, RetrievalRequest};
use crate::query_log::{mean_score, SqliteQueryLog};
use crate::scoring::Polarity;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "feedrank")]
#[command(version, about = "피드백 학습 하이브리드 검색 엔진", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: ~/.feedrank/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 텍스트 또는 파일을 프래그먼트로 추가
    Add {
        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 읽어들일 파일 경로
        #[arg(long)]
        file: Option<PathBuf>,

        /// 출처 (기본: 파일 경로 또는 "manual")
        #[arg(short, long)]
        source: Option<String>,

        /// 제목
        #[arg(long)]
        title: Option<String>,
    },

    /// 프래그먼트 삭제 (벡터 포함)
    Remove {
        /// 프래그먼트 ID
        id: i64,
    },

    /// 근거 프래그먼트 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 (기본: 설정값)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// 쿼리 확장 끄기
        #[arg(long)]
        no_expansion: bool,

        /// HyDE 임베딩 사용
        #[arg(long)]
        hyde: bool,

        /// 시맨틱 랭커 끄기
        #[arg(long)]
        lexical_only: bool,

        /// 히스토리 랭커 끄기
        #[arg(long)]
        no_history: bool,

        /// JSON 출력
        #[arg(long)]
        json: bool,
    },

    /// 피드백 적용
    Feedback {
        /// 피드백 대상 쿼리
        query: String,

        /// positive | negative (up/down, +/-)
        polarity: Polarity,

        /// 대상 프래그먼트 (생략 시 응답 전체)
        #[arg(short, long)]
        fragment: Option<i64>,

        /// 이벤트 ID (생략 시 자동 생성)
        #[arg(long)]
        event_id: Option<String>,
    },

    /// 플래그된 쿼리 관리
    Flags {
        #[command(subcommand)]
        action: FlagAction,
    },

    /// 응답 캐시 관리
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// 검색 기록 분석
    Log {
        #[command(subcommand)]
        action: LogAction,
    },

    /// 렉시컬 인덱스 재구축
    RebuildIndex,

    /// 상태 확인
    Status,
}

#[derive(Subcommand)]
pub enum FlagAction {
    /// 플래그 목록
    List {
        /// 해결된 플래그 포함
        #[arg(long)]
        all: bool,
    },
    /// 플래그 해결 (기록은 유지)
    Resolve {
        /// 쿼리 텍스트
        query: Option<String>,

        /// 쿼리 키 직접 지정
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum LogAction {
    /// 평균 스코어가 낮은 쿼리 (지식 공백 후보)
    Gaps {
        /// 평균 퓨전 스코어 기준
        #[arg(short, long, default_value = "0.02")]
        threshold: f64,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// 자주 들어오는 쿼리
    Common {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// 최근 검색 기록
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// 캐시 통계
    Stats,
    /// 최근 캐시 항목
    Recent {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// 만료 항목 삭제
    Sweep,
    /// 전체 삭제
    Clear,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => FeedrankConfig::load_from(path)?,
        None => FeedrankConfig::load()?,
    };

    match cli.command {
        Commands::Add {
            text,
            file,
            source,
            title,
        } => cmd_add(&config, text, file, source, title).await,
        Commands::Remove { id } => cmd_remove(&config, id).await,
        Commands::Query {
            query,
            top_k,
            no_expansion,
            hyde,
            lexical_only,
            no_history,
            json,
        } => {
            let mut request = RetrievalRequest::from_config(&query, &config);
            if let Some(k) = top_k {
                request.top_k = k;
            }
            request.flags = RetrievalFlags {
                use_expansion: request.flags.use_expansion && !no_expansion,
                use_hyde: request.flags.use_hyde || hyde,
                use_hybrid: !lexical_only,
                use_history: request.flags.use_history && !no_history,
            };
            cmd_query(&config, request, json).await
        }
        Commands::Feedback {
            query,
            polarity,
            fragment,
            event_id,
        } => cmd_feedback(&config, &query, polarity, fragment, event_id).await,
        Commands::Flags { action } => cmd_flags(&config, action).await,
        Commands::Cache { action } => cmd_cache(&config, action),
        Commands::Log { action } => cmd_log(&config, action),
        Commands::RebuildIndex => cmd_rebuild_index(&config).await,
        Commands::Status => cmd_status(&config).await,
    }
}

/// 프래그먼트 추가
async fn cmd_add(
    config: &FeedrankConfig,
    text: Option<String>,
    file: Option<PathBuf>,
    source: Option<String>,
    title: Option<String>,
) -> Result<()> {
    let (content, default_source) = match (text, file) {
        (Some(text), None) => (text, "manual".to_string()),
        (None, Some(path)) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            (content, path.display().to_string())
        }
        (Some(_), Some(_)) => bail!("--text와 --file 중 하나만 지정하세요"),
        (None, None) => bail!("--text 또는 --file 중 하나를 지정하세요"),
    };

    if content.trim().is_empty() {
        bail!("빈 내용은 추가할 수 없습니다");
    }

    let paths = DataPaths::new(config.data_dir());
    let store = KnowledgeStore::open(&paths.knowledge_db())?;

    let id = store.add_fragment(NewFragment {
        source: source.unwrap_or(default_source),
        title,
        content: content.clone(),
    })?;
    println!("[OK] 프래그먼트 #{} 추가됨", id);

    if has_api_key() {
        print!("[*] 임베딩 생성 중... ");
        let embedder = GeminiEmbedding::from_env_with_dimension(config.providers.embedding_dimension)?
            .with_retry(config.providers.retry);
        let embedding = embedder.embed(&content).await?;

        let vectors = LanceVectorStore::open(&paths.vectors()).await?;
        vectors
            .insert_batch(&[VectorEntry {
                fragment_id: id,
                embedding,
            }])
            .await?;
        println!("완료");
    } else {
        println!("[!] API 키 미설정: 벡터 인덱스는 건너뜁니다 (렉시컬 검색만 가능)");
    }

    Ok(())
}

/// 프래그먼트 삭제
async fn cmd_remove(config: &FeedrankConfig, id: i64) -> Result<()> {
    let paths = DataPaths::new(config.data_dir());
    let store = KnowledgeStore::open(&paths.knowledge_db())?;

    if !store.delete_fragment(id)? {
        println!("[!] 프래그먼트 #{} 없음", id);
        return Ok(());
    }
    println!("[OK] 프래그먼트 #{} 삭제됨", id);

    if paths.vectors().exists() {
        let vectors = LanceVectorStore::open(&paths.vectors()).await?;
        let removed = vectors.delete_by_fragment(id).await?;
        println!("   벡터 {} 건 삭제", removed);
    }

    Ok(())
}

/// 근거 검색
async fn cmd_query(config: &FeedrankConfig, request: RetrievalRequest, json: bool) -> Result<()> {
    let engine = RetrievalEngine::open(config).await?;

    if !json {
        println!("[*] 검색 중: \"{}\"", request.query);
    }

    if let CacheLookup::Hit(entry) = engine.cached_answer(&request) {
        if !json {
            println!("\n[OK] 캐시된 답변 ({}):", entry.created_at.format("%Y-%m-%d %H:%M"));
            println!("   {}", truncate_text(&entry.answer.answer, 400));
        }
    }

    let evidence = engine.retrieve(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&evidence)?);
        return Ok(());
    }

    for degradation in &evidence.degradations {
        println!("[!] {}", degradation);
    }

    if !evidence.expanded_terms.is_empty() {
        println!("[*] 확장 용어: {}", evidence.expanded_terms.join(", "));
    }

    if evidence.items.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!(
        "\n[OK] 검색 결과 ({} 건, {}ms):\n",
        evidence.items.len(),
        evidence.elapsed_ms
    );

    for (i, item) in evidence.items.iter().enumerate() {
        let ranks = item
            .fused
            .ranks
            .iter()
            .map(|(tag, rank)| format!("{}#{}", tag, rank))
            .collect::<Vec<_>>()
            .join(" ");

        println!(
            "{}. #{} [score: {:.4}, adj: {:+.2}] {}",
            i + 1,
            item.fragment.id,
            item.fused.score,
            item.fused.adjustment,
            ranks
        );
        if let Some(title) = &item.fragment.title {
            println!("   제목: {}", title);
        }
        println!("   출처: {}", item.fragment.source);
        println!("   내용: {}", truncate_text(&item.fragment.content, 200));
        println!();
    }

    println!("[*] 쿼리 키: {}", evidence.query_key);

    Ok(())
}

/// 피드백 적용
async fn cmd_feedback(
    config: &FeedrankConfig,
    query: &str,
    polarity: Polarity,
    fragment: Option<i64>,
    event_id: Option<String>,
) -> Result<()> {
    let engine = RetrievalEngine::open(config).await?;

    let scope = match fragment {
        Some(id) => FeedbackScope::Fragment(id),
        None => FeedbackScope::WholeResponse,
    };
    let mut event = FeedbackEvent::new(query, scope, polarity);
    if let Some(id) = event_id {
        event = event.with_event_id(id);
    }

    let outcome = engine.apply_feedback(&event)?;

    println!("[OK] {} 피드백 적용 (이벤트 {})", polarity.as_str(), event.event_id);
    for (id, value) in &outcome.fragments_adjusted {
        println!("   #{} adjustment -> {:+.2}", id, value);
    }
    if outcome.mapping_learned {
        println!("   쿼리 매핑 학습됨");
    }
    if outcome.cache_entries_invalidated > 0 {
        println!("   캐시 {} 건 무효화", outcome.cache_entries_invalidated);
    }
    if let Some(err) = &outcome.cache_error {
        println!("[!] 캐시 무효화 실패: {}", err);
    }
    if outcome.query_flagged {
        println!("[!] 반복된 부정 피드백으로 쿼리가 검토 대상으로 표시되었습니다");
    }

    Ok(())
}

/// 플래그 관리
async fn cmd_flags(config: &FeedrankConfig, action: FlagAction) -> Result<()> {
    let engine = RetrievalEngine::open(config).await?;
    let learner = engine.learner();

    match action {
        FlagAction::List { all } => {
            let flags = learner.flagged_queries(all)?;
            if flags.is_empty() {
                println!("[OK] 플래그된 쿼리가 없습니다.");
                return Ok(());
            }

            println!("[!] 플래그된 쿼리 ({} 건):\n", flags.len());
            for flag in flags {
                let status = match flag.resolved_at {
                    Some(at) => format!("해결됨 {}", at.format("%Y-%m-%d")),
                    None => "미해결".to_string(),
                };
                println!("  \"{}\" [{}]", flag.query, status);
                println!("        키: {}", flag.query_key);
                println!(
                    "        {} ({})",
                    flag.reason,
                    flag.flagged_at.format("%Y-%m-%d %H:%M")
                );
                println!();
            }
        }
        FlagAction::Resolve { query, key } => {
            let key = match (key, query) {
                (Some(key), _) => key,
                (None, Some(query)) => query_key(&query),
                (None, None) => bail!("쿼리 또는 --key 를 지정하세요"),
            };

            if learner.resolve_flag(&key)? {
                println!("[OK] 플래그 해결됨: {}", key);
            } else {
                println!("[!] 미해결 플래그가 없습니다: {}", key);
            }
        }
    }

    Ok(())
}

/// 캐시 관리 (엔진 없이 캐시 저장소만 염)
fn cmd_cache(config: &FeedrankConfig, action: CacheAction) -> Result<()> {
    let paths = DataPaths::new(config.data_dir());
    let backend = SqliteCacheBackend::open(&paths.cache_db())?;
    let cache = ResponseCache::with_ttl_hours(Arc::new(backend), config.cache.ttl_hours);

    match action {
        CacheAction::Stats => {
            let stats = cache.stats()?;
            println!("[*] 캐시 항목: {} 건", stats.total_entries);
            println!("    유효: {} 건", stats.live_entries);
            println!("    무효화: {} 건", stats.invalidated_entries);
            println!("    총 히트: {}", stats.total_hits);
        }
        CacheAction::Recent { limit } => {
            let entries = cache.recent(limit)?;
            if entries.is_empty() {
                println!("[!] 유효한 캐시 항목이 없습니다.");
            }
            for entry in entries {
                println!(
                    "  [{}] \"{}\" (만료 {})",
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.answer.query,
                    entry.expires_at.format("%Y-%m-%d %H:%M")
                );
                println!("        {}", truncate_text(&entry.answer.answer, 120));
            }
        }
        CacheAction::Sweep => {
            let removed = cache.sweep()?;
            println!("[OK] 만료 항목 {} 건 삭제", removed);
        }
        CacheAction::Clear => {
            let removed = cache.clear()?;
            println!("[OK] 캐시 {} 건 삭제", removed);
        }
    }

    Ok(())
}

/// 검색 기록 분석
fn cmd_log(config: &FeedrankConfig, action: LogAction) -> Result<()> {
    let paths = DataPaths::new(config.data_dir());
    let log = SqliteQueryLog::open(&paths.query_log_db())?;

    match action {
        LogAction::Gaps { threshold, limit } => {
            let records = log.low_score_queries(threshold, limit)?;
            if records.is_empty() {
                println!("[OK] 평균 스코어 {} 미만인 쿼리가 없습니다.", threshold);
                return Ok(());
            }

            println!("[!] 지식 공백 후보 ({} 건):\n", records.len());
            for record in records {
                let avg = mean_score(&record.scores);
                println!(
                    "  [{}] \"{}\" (평균 {:.4}, 결과 {} 건)",
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    truncate_text(&record.query, 80),
                    avg,
                    record.fragment_ids.len()
                );
            }
        }
        LogAction::Common { limit } => {
            let common = log.common_queries(limit)?;
            if common.is_empty() {
                println!("[!] 검색 기록이 없습니다.");
            }
            for (i, query) in common.iter().enumerate() {
                println!(
                    "{:>3}. \"{}\" x{} (평균 {:.4})",
                    i + 1,
                    truncate_text(&query.query, 80),
                    query.count,
                    query.avg_score
                );
            }
        }
        LogAction::Recent { limit } => {
            for record in log.recent(limit)? {
                println!(
                    "  [{}] \"{}\" -> {:?} ({}ms)",
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    truncate_text(&record.query, 80),
                    record.fragment_ids,
                    record.response_time_ms
                );
            }
        }
    }

    Ok(())
}

/// 렉시컬 인덱스 재구축
async fn cmd_rebuild_index(config: &FeedrankConfig) -> Result<()> {
    let engine = RetrievalEngine::open(config).await?;
    let count = engine.rebuild_index()?;
    println!("[OK] 렉시컬 인덱스 재구축: {} 프래그먼트", count);
    Ok(())
}

/// 상태 확인
async fn cmd_status(config: &FeedrankConfig) -> Result<()> {
    println!("feedrank v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let paths = DataPaths::new(config.data_dir());
    println!("[*] 데이터 디렉토리: {}", paths.root().display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정 (렉시컬 검색만 사용)");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match KnowledgeStore::open(&paths.knowledge_db()).and_then(|s| s.stats()) {
        Ok(stats) => {
            println!("[OK] 프래그먼트: {} 건", stats.fragment_count);
            println!("     총 크기: {}", format_bytes(stats.total_content_bytes));
        }
        Err(e) => println!("[!] 지식 저장소 열기 실패: {}", e),
    }

    if paths.vectors().exists() {
        match LanceVectorStore::open(&paths.vectors()).await {
            Ok(vectors) => match vectors.count().await {
                Ok(count) => println!("[OK] 벡터 인덱스: {} 건", count),
                Err(e) => println!("[!] 벡터 개수 조회 실패: {}", e),
            },
            Err(e) => println!("[!] 벡터 인덱스 열기 실패: {}", e),
        }
    }

    let engine = RetrievalEngine::open(config).await?;
    let stats = engine.learner().stats()?;
    println!(
        "[OK] 학습 상태: adjustment {} 건 (부스트 {}, 페널티 {}), 매핑 {} 건, 이벤트 {} 건",
        stats.adjusted_fragments,
        stats.boosted_fragments,
        stats.penalized_fragments,
        stats.total_mappings,
        stats.processed_events
    );
    if stats.active_flags > 0 {
        println!("[!] 미해결 플래그: {} 건", stats.active_flags);
    }

    if let Some(cache) = engine.cache() {
        let cache_stats = cache.stats()?;
        println!(
            "[OK] 캐시: 유효 {} / 전체 {} 건, 히트 {}",
            cache_stats.live_entries, cache_stats.total_entries, cache_stats.total_hits
        );
    }

    let log_stats = SqliteQueryLog::open(&paths.query_log_db())?.stats()?;
    println!(
        "[OK] 검색 기록: {} 건 (고유 {}), 평균 {:.0}ms",
        log_stats.total_queries, log_stats.unique_queries, log_stats.avg_response_time_ms
    );

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
