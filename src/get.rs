//! Document retrieval by id for `kedro-rag get`.

use crate::config::Config;
use crate::kb::KnowledgeBase;

pub async fn run_get(config: &Config, id: &str) -> anyhow::Result<()> {
    let kb = KnowledgeBase::new(config.clone())?;
    let doc = kb.get_document(id).await;
    kb.shutdown().await;
    let doc = doc?;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!(
        "title:        {}",
        doc.title.as_deref().unwrap_or("(untitled)")
    );
    println!("kind:         {}", doc.kind);
    println!("source:       {}", doc.source);
    println!("origin:       {}", doc.origin);
    if let Some(ref author) = doc.author {
        println!("author:       {}", author);
    }
    println!("timestamp:    {}", doc.timestamp);
    println!("ingested_at:  {}", doc.ingested_at);
    println!("hash:         {}", doc.content_hash);
    println!("metadata:     {}", doc.metadata);
    println!();

    println!("--- Body ---");
    println!("{}", doc.body);
    println!();

    println!("--- Chunks ({}) ---", doc.chunks.len());
    for chunk in &doc.chunks {
        println!("[chunk {}]", chunk.seq);
        println!("{}", chunk.text);
        println!();
    }

    Ok(())
}
